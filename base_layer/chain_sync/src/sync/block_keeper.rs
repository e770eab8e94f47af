// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;

use log::*;
use num_format::{Locale, ToFormattedString};
use tari_sync_types::{Block, BlockHash, BlockHeader};
use tokio::time::Instant;

use crate::{
    chain::{Chain, ChainError},
    config::ChainSyncConfig,
    peers::{BanLevel, Peer, PeerSet, ServiceFlags},
    sync::{
        error::BlockKeeperError,
        fast_sync::FastSync,
        fast_sync_peers::FastSyncPeerPool,
        msg_fetcher::MsgFetcher,
        storage::BlockStorage,
    },
};

const LOG_TARGET: &str = "c::cs::sync::block_keeper";

/// The sync strategy chosen for a single sync cycle, together with the reference peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncType {
    NoNeedSync,
    FastSync(Peer),
    RegularSync(Peer),
}

/// Decides every sync cycle whether the local chain needs to catch up and drives fast or regular sync accordingly
pub struct BlockKeeper {
    config: ChainSyncConfig,
    chain: Arc<dyn Chain>,
    peers: Arc<PeerSet>,
    msg_fetcher: Arc<MsgFetcher>,
    fast_sync: FastSync,
}

impl BlockKeeper {
    pub fn new(
        config: ChainSyncConfig,
        chain: Arc<dyn Chain>,
        peers: Arc<PeerSet>,
        storage: Arc<BlockStorage>,
    ) -> Self {
        let msg_fetcher = Arc::new(MsgFetcher::new(
            config.clone(),
            peers.clone(),
            storage.clone(),
            Arc::new(FastSyncPeerPool::new()),
        ));
        let fast_sync = FastSync::new(
            config.clone(),
            chain.clone(),
            peers.clone(),
            storage,
            msg_fetcher.clone(),
        );
        Self {
            config,
            chain,
            peers,
            msg_fetcher,
            fast_sync,
        }
    }

    pub fn msg_fetcher(&self) -> &Arc<MsgFetcher> {
        &self.msg_fetcher
    }

    pub fn fast_sync(&self) -> &FastSync {
        &self.fast_sync
    }

    pub async fn check_sync_type(&self) -> Result<SyncType, ChainError> {
        let best_height = self.chain.best_block_height().await?;

        if let Some(peer) = self
            .peers
            .best_irreversible_peer(ServiceFlags::FULL_NODE | ServiceFlags::FAST_SYNC)
        {
            if peer.justified_height() >= best_height.saturating_add(self.config.min_gap_start_fast_sync) {
                debug!(
                    target: LOG_TARGET,
                    "Fast sync from peer {} (local: #{}, peer justified: #{})",
                    peer.id(),
                    best_height,
                    peer.justified_height()
                );
                return Ok(SyncType::FastSync(peer));
            }
        }

        if let Some(peer) = self.peers.best_peer(ServiceFlags::FULL_NODE) {
            if peer.height() > best_height {
                debug!(
                    target: LOG_TARGET,
                    "Regular sync from peer {} (local: #{}, peer: #{})",
                    peer.id(),
                    best_height,
                    peer.height()
                );
                return Ok(SyncType::RegularSync(peer));
            }
        }

        Ok(SyncType::NoNeedSync)
    }

    /// Requests blocks one at a time from `peer`, starting above the local tip. An orphan is retried at the same
    /// height. The cycle ends early once the peer keeps returning blocks that do not advance the local tip.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %peer.id()), err)]
    pub async fn regular_block_sync(&self, peer: &Peer) -> Result<(), BlockKeeperError> {
        let best_height = self.chain.best_block_height().await?;
        let target_height = best_height
            .saturating_add(self.config.max_num_of_blocks_regular_sync)
            .min(peer.height());
        let mut height = best_height + 1;
        let mut orphan_retries = 0;
        let mut stalls = 0;

        while height <= target_height {
            let block = match self.msg_fetcher.require_block(peer.id(), height).await {
                Ok(block) => block,
                Err(err) => {
                    if let Some(level) = err.ban_level() {
                        self.peers.process_illegal(peer.id(), level, &err.to_string()).await;
                    }
                    return Err(err.into());
                },
            };

            let result = match self.chain.process_block(block).await {
                Ok(result) => result,
                Err(err) => {
                    self.peers
                        .process_illegal(peer.id(), BanLevel::MsgIllegal, &err.to_string())
                        .await;
                    return Err(BlockKeeperError::BlockRejected {
                        height,
                        peer: peer.id().clone(),
                        source: err,
                    });
                },
            };

            if result.is_orphan() {
                orphan_retries += 1;
                if orphan_retries > self.config.max_regular_sync_orphan_retries {
                    warn!(
                        target: LOG_TARGET,
                        "Peer {} returned orphan block #{} {} time(s), ending regular sync", peer.id(), height, orphan_retries
                    );
                    return Ok(());
                }
                debug!(target: LOG_TARGET, "Block #{} from peer {} is an orphan, retrying", height, peer.id());
                continue;
            }
            orphan_retries = 0;

            let new_best_height = self.chain.best_block_height().await?;
            if new_best_height < height {
                stalls += 1;
                if stalls >= self.config.max_regular_sync_stalls {
                    warn!(
                        target: LOG_TARGET,
                        "Block #{} from peer {} did not advance the local chain (at #{}), ending regular sync",
                        height,
                        peer.id(),
                        new_best_height
                    );
                    return Ok(());
                }
            } else {
                stalls = 0;
            }
            height = new_best_height + 1;
        }

        debug!(
            target: LOG_TARGET,
            "Regular sync from peer {} finished at #{}",
            peer.id(),
            height.saturating_sub(1).to_formatted_string(&Locale::en)
        );
        Ok(())
    }

    /// Runs one sync cycle. Returns true if the local chain advanced.
    pub async fn start_sync(&self) -> bool {
        let best_height = match self.chain.best_block_height().await {
            Ok(height) => height,
            Err(err) => {
                error!(target: LOG_TARGET, "Failed to read the local best height: {}", err);
                return false;
            },
        };

        let result = match self.check_sync_type().await {
            Ok(SyncType::FastSync(peer)) => self.fast_sync.process(&peer).await.map_err(BlockKeeperError::from),
            Ok(SyncType::RegularSync(peer)) => self.regular_block_sync(&peer).await,
            Ok(SyncType::NoNeedSync) => return false,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            warn!(target: LOG_TARGET, "Sync cycle failed: {}", err);
        }

        match self.chain.best_block_height().await {
            Ok(new_best_height) if new_best_height > best_height => {
                info!(
                    target: LOG_TARGET,
                    "Chain advanced from #{} to #{}",
                    best_height.to_formatted_string(&Locale::en),
                    new_best_height.to_formatted_string(&Locale::en)
                );
                true
            },
            Ok(_) => false,
            Err(err) => {
                error!(target: LOG_TARGET, "Failed to read the local best height: {}", err);
                false
            },
        }
    }
}

/// Returns headers of the local main chain from the first known `locator` hash (or genesis) up to `stop_hash`,
/// `skip` blocks apart and at most `max_num` of them. The stop header is always the last header if it is reached.
pub async fn locate_headers(
    chain: &dyn Chain,
    locator: &[BlockHash],
    stop_hash: &BlockHash,
    skip: u64,
    max_num: u64,
) -> Result<Vec<BlockHeader>, ChainError> {
    let mut start_header = chain.get_header_by_height(0).await?;
    for hash in locator {
        match chain.get_header_by_hash(hash).await {
            Ok(header) => {
                if chain.in_main_chain(hash).await? {
                    start_header = header;
                    break;
                }
            },
            Err(err) if err.is_value_not_found() => {},
            Err(err) => return Err(err),
        }
    }

    let stop_header = chain.get_header_by_hash(stop_hash).await?;
    let mut headers = Vec::new();
    if max_num == 0 || !chain.in_main_chain(stop_hash).await? || stop_header.height < start_header.height {
        return Ok(headers);
    }

    let start_height = start_header.height;
    headers.push(start_header);
    if stop_header.height == start_height {
        return Ok(headers);
    }

    let mut index = start_height;
    for _ in 1..max_num {
        index = index.saturating_add(skip + 1);
        if index >= stop_header.height {
            headers.push(stop_header);
            break;
        }
        headers.push(chain.get_header_by_height(index).await?);
    }
    Ok(headers)
}

/// Returns consecutive main chain blocks from the first known `locator` hash up to `stop_hash`, at most `max_num` of
/// them. Stops early, after at least one block, once `deadline` passes.
pub async fn locate_blocks(
    chain: &dyn Chain,
    locator: &[BlockHash],
    stop_hash: &BlockHash,
    max_num: u64,
    deadline: Instant,
) -> Result<Vec<Arc<Block>>, ChainError> {
    let headers = locate_headers(chain, locator, stop_hash, 0, max_num).await?;
    let mut blocks = Vec::with_capacity(headers.len());
    for header in headers {
        if !blocks.is_empty() && Instant::now() >= deadline {
            debug!(target: LOG_TARGET, "Deadline passed while locating blocks, returning {}", blocks.len());
            break;
        }
        blocks.push(Arc::new(chain.get_block_by_hash(&header.hash()).await?));
    }
    Ok(blocks)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test_helpers::{create_chain, MockChain};

    fn heights(headers: &[BlockHeader]) -> Vec<u64> {
        headers.iter().map(|h| h.height).collect()
    }

    #[tokio::test]
    async fn it_locates_a_skeleton() {
        let blocks = create_chain(200);
        let chain = MockChain::new(blocks.clone());
        let locator = vec![blocks[10].hash()];

        let headers = locate_headers(&chain, &locator, &blocks[150].hash(), 63, 11).await.unwrap();
        assert_eq!(heights(&headers), vec![10, 74, 138, 150]);

        let headers = locate_headers(&chain, &locator, &blocks[150].hash(), 63, 2).await.unwrap();
        assert_eq!(heights(&headers), vec![10, 74]);

        let headers = locate_headers(&chain, &locator, &blocks[10].hash(), 63, 11).await.unwrap();
        assert_eq!(heights(&headers), vec![10]);
    }

    #[tokio::test]
    async fn it_starts_at_genesis_without_a_known_locator() {
        let blocks = create_chain(20);
        let chain = MockChain::new(blocks[..10].to_vec());
        let unknown = vec![blocks[15].hash(), BlockHash::zero()];
        let headers = locate_headers(&chain, &unknown, &blocks[5].hash(), 0, 100).await.unwrap();
        assert_eq!(heights(&headers), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn it_returns_nothing_when_stop_is_below_start() {
        let blocks = create_chain(20);
        let chain = MockChain::new(blocks.clone());
        let headers = locate_headers(&chain, &[blocks[10].hash()], &blocks[5].hash(), 0, 100)
            .await
            .unwrap();
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn it_errors_on_an_unknown_stop_hash() {
        let blocks = create_chain(20);
        let chain = MockChain::new(blocks[..10].to_vec());
        let err = locate_headers(&chain, &[blocks[1].hash()], &blocks[15].hash(), 0, 100)
            .await
            .unwrap_err();
        assert!(err.is_value_not_found());
    }

    #[tokio::test]
    async fn it_locates_blocks_up_to_the_limit() {
        let blocks = create_chain(100);
        let chain = MockChain::new(blocks.clone());
        let deadline = Instant::now() + Duration::from_secs(10);
        let located = locate_blocks(&chain, &[blocks[10].hash()], &blocks[90].hash(), 64, deadline)
            .await
            .unwrap();
        assert_eq!(located.len(), 64);
        assert_eq!(located[0].hash(), blocks[10].hash());
        assert_eq!(located[63].hash(), blocks[73].hash());

        let located = locate_blocks(&chain, &[blocks[10].hash()], &blocks[12].hash(), 64, deadline)
            .await
            .unwrap();
        assert_eq!(located.len(), 3);
    }

    #[tokio::test]
    async fn it_returns_one_block_after_the_deadline() {
        let blocks = create_chain(20);
        let chain = MockChain::new(blocks.clone());
        let located = locate_blocks(&chain, &[blocks[1].hash()], &blocks[10].hash(), 64, Instant::now())
            .await
            .unwrap();
        assert_eq!(located.len(), 1);
    }
}
