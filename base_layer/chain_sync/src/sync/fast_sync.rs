// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;

use log::*;
use num_format::{Locale, ToFormattedString};
use tari_sync_types::{Block, BlockHash, BlockHeader};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{Chain, ChainError},
    config::ChainSyncConfig,
    peers::{BanLevel, Peer, PeerId, PeerSet},
    sync::{
        block_processor::BlockProcessor,
        error::{FastSyncError, FetchError},
        msg_fetcher::{FetchBlocksWork, MsgFetcher},
        storage::{BlockStorage, SyncStorageError},
    },
};

const LOG_TARGET: &str = "c::cs::sync::fast_sync";

/// Number of locator entries taken one block apart before the step starts doubling
const LOCATOR_LINEAR_ENTRIES: usize = 9;

/// Builds a block locator from the local tip back to genesis. The first entries are one block apart, after which the
/// distance doubles with every entry.
pub async fn block_locator(chain: &dyn Chain) -> Result<Vec<BlockHash>, ChainError> {
    let mut header = chain.best_block_header().await?;
    let mut locator = Vec::new();
    let mut step = 1u64;
    loop {
        locator.push(header.hash());
        if header.height == 0 {
            break;
        }
        header = chain.get_header_by_height(header.height.saturating_sub(step)).await?;
        if locator.len() >= LOCATOR_LINEAR_ENTRIES {
            step *= 2;
        }
    }
    Ok(locator)
}

pub struct FastSync {
    config: ChainSyncConfig,
    chain: Arc<dyn Chain>,
    peers: Arc<PeerSet>,
    storage: Arc<BlockStorage>,
    msg_fetcher: Arc<MsgFetcher>,
    block_processor: BlockProcessor,
}

impl FastSync {
    pub fn new(
        config: ChainSyncConfig,
        chain: Arc<dyn Chain>,
        peers: Arc<PeerSet>,
        storage: Arc<BlockStorage>,
        msg_fetcher: Arc<MsgFetcher>,
    ) -> Self {
        let block_processor = BlockProcessor::new(chain.clone(), storage.clone(), peers.clone());
        Self {
            config,
            chain,
            peers,
            storage,
            msg_fetcher,
            block_processor,
        }
    }

    /// Runs one fast sync session against `reference_peer`. Session state is reset whatever the outcome.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %reference_peer.id()), err)]
    pub async fn process(&self, reference_peer: &Peer) -> Result<(), FastSyncError> {
        let result = self.sync(reference_peer).await;
        if let Err(err) = self.reset_parameter().await {
            error!(target: LOG_TARGET, "Failed to reset fast sync storage: {}", err);
        }
        result
    }

    async fn sync(&self, reference_peer: &Peer) -> Result<(), FastSyncError> {
        let stop_block = self.find_sync_range(reference_peer).await?;
        let tasks = self.create_fetch_blocks_tasks(reference_peer, &stop_block).await?;
        let start_height = match tasks.first() {
            Some(task) => task.start_header.height,
            None => return Ok(()),
        };
        info!(
            target: LOG_TARGET,
            "Fast syncing blocks #{} to #{} in {} range(s) from {} peer(s)",
            start_height.to_formatted_string(&Locale::en),
            stop_block.height().to_formatted_string(&Locale::en),
            tasks.len(),
            self.msg_fetcher.sync_peers().size()
        );

        let downloaded = Arc::new(Notify::new());
        let downloads_done = CancellationToken::new();
        let process_stop = CancellationToken::new();
        let (fetch_result, process_result) = futures::join!(
            self.msg_fetcher.parallel_fetch_blocks(
                tasks,
                downloaded.clone(),
                downloads_done.clone(),
                process_stop.clone()
            ),
            self.block_processor
                .process(downloaded, downloads_done, process_stop, start_height),
        );

        let next_height = process_result?;
        match fetch_result {
            Ok(_) => {},
            Err(FetchError::SyncPeerPoolExhausted) => {
                info!(
                    target: LOG_TARGET,
                    "Fast sync peers exhausted, stopped at block #{}",
                    next_height.to_formatted_string(&Locale::en)
                );
            },
            Err(err) => return Err(err.into()),
        }
        debug!(
            target: LOG_TARGET,
            "Fast sync session applied blocks up to #{}",
            next_height.saturating_sub(1).to_formatted_string(&Locale::en)
        );
        Ok(())
    }

    /// Fixes the end of the session: the block the reference peer holds at the highest height that is both
    /// `fast_sync_pivot_gap` below its justified height and within a single session's reach.
    pub async fn find_sync_range(&self, reference_peer: &Peer) -> Result<Arc<Block>, FastSyncError> {
        let best_height = self.chain.best_block_height().await?;
        let length = reference_peer
            .justified_height()
            .saturating_sub(self.config.fast_sync_pivot_gap)
            .saturating_sub(best_height)
            .min(self.config.max_num_of_blocks_per_sync());
        if length == 0 {
            return Err(FastSyncError::NoSyncPeer);
        }

        let target_height = best_height + length;
        match self.msg_fetcher.require_block(reference_peer.id(), target_height).await {
            Ok(block) => Ok(block),
            Err(err) => {
                if let Some(level) = err.ban_level() {
                    self.peers
                        .process_illegal(reference_peer.id(), level, &err.to_string())
                        .await;
                }
                Err(err.into())
            },
        }
    }

    /// Collects header skeletons, fills the session peer pool with peers that agree with the reference peer and
    /// splits the reference skeleton into block ranges.
    pub async fn create_fetch_blocks_tasks(
        &self,
        reference_peer: &Peer,
        stop_block: &Block,
    ) -> Result<Vec<FetchBlocksWork>, FastSyncError> {
        let peer_ids = self
            .peers
            .peers_by_height(stop_block.height() + self.config.fast_sync_pivot_gap)
            .into_iter()
            .map(|p| p.id().clone())
            .collect::<Vec<_>>();
        if peer_ids.is_empty() {
            return Err(FastSyncError::NoSyncPeer);
        }

        let locator = block_locator(self.chain.as_ref()).await?;
        let skip = self.config.num_of_blocks_skeleton_gap - 1;
        let skeletons = self
            .msg_fetcher
            .parallel_fetch_headers(&peer_ids, &locator, stop_block.hash(), skip)
            .await;
        if skeletons.is_empty() {
            return Err(FastSyncError::NoSkeletonFound);
        }

        let main_skeleton = skeletons.get(reference_peer.id()).ok_or(FastSyncError::NoMainSkeleton)?;
        self.check_main_skeleton(reference_peer.id(), main_skeleton).await?;

        let sync_peers = self.msg_fetcher.sync_peers();
        sync_peers.add(reference_peer.id().clone());
        for (peer_id, skeleton) in &skeletons {
            if peer_id == reference_peer.id() {
                continue;
            }
            if is_same_skeleton(main_skeleton, skeleton) {
                sync_peers.add(peer_id.clone());
            } else {
                debug!(
                    target: LOG_TARGET,
                    "Skeleton from peer {} does not match the reference skeleton, excluding it from fast sync", peer_id
                );
            }
        }

        let num_tasks = (main_skeleton.len() - 1).min(self.config.max_size_of_sync_skeleton - 1);
        let tasks = main_skeleton
            .windows(2)
            .take(num_tasks)
            .map(|pair| FetchBlocksWork::new(pair[0].clone(), pair[1].clone()))
            .collect::<Vec<_>>();
        Ok(tasks)
    }

    async fn check_main_skeleton(&self, peer_id: &PeerId, skeleton: &[BlockHeader]) -> Result<(), FastSyncError> {
        let err = if skeleton.len() < self.config.min_size_of_sync_skeleton {
            FastSyncError::SkeletonSize {
                peer: peer_id.clone(),
                actual: skeleton.len(),
                min: self.config.min_size_of_sync_skeleton,
            }
        } else if skeleton.windows(2).any(|pair| pair[0].height >= pair[1].height) {
            FastSyncError::InvalidSkeleton { peer: peer_id.clone() }
        } else {
            return Ok(());
        };
        self.peers
            .process_illegal(peer_id, BanLevel::MsgIllegal, &err.to_string())
            .await;
        Err(err)
    }

    /// Clears the session peer pool, the block buffer and any pending responses
    pub async fn reset_parameter(&self) -> Result<(), SyncStorageError> {
        self.msg_fetcher.sync_peers().clear();
        self.msg_fetcher.reset_parameter().await;
        self.storage.reset_parameter()
    }
}

fn is_same_skeleton(main: &[BlockHeader], other: &[BlockHeader]) -> bool {
    main.len() == other.len() && main.iter().zip(other).all(|(a, b)| a.hash() == b.hash())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{create_chain, MockChain};

    async fn locator_heights(chain: &MockChain) -> Vec<u64> {
        let mut heights = Vec::new();
        for hash in block_locator(chain).await.unwrap() {
            heights.push(chain.get_header_by_hash(&hash).await.unwrap().height);
        }
        heights
    }

    #[tokio::test]
    async fn locator_is_linear_then_exponential() {
        let chain = MockChain::new(create_chain(101));
        let heights = locator_heights(&chain).await;
        let mut expected = (92..=100).rev().collect::<Vec<u64>>();
        expected.extend_from_slice(&[91, 89, 85, 77, 61, 29, 0]);
        assert_eq!(heights, expected);
    }

    #[tokio::test]
    async fn locator_of_short_chains_ends_at_genesis() {
        let chain = MockChain::new(create_chain(1));
        assert_eq!(locator_heights(&chain).await, vec![0]);
        let chain = MockChain::new(create_chain(5));
        assert_eq!(locator_heights(&chain).await, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn skeletons_must_match_in_length_and_hash() {
        let blocks = create_chain(10);
        let main = blocks.iter().map(|b| b.header.clone()).collect::<Vec<_>>();
        assert!(is_same_skeleton(&main, &main.clone()));
        assert!(!is_same_skeleton(&main, &main[..9]));
        let mut other = main.clone();
        other[3].nonce += 1;
        assert!(!is_same_skeleton(&main, &other));
    }
}
