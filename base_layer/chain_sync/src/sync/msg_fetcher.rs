// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex as StdMutex},
};

use log::*;
use tari_sync_types::{Block, BlockHash, BlockHeader};
use tokio::{
    sync::{mpsc, Mutex, Notify},
    task::JoinSet,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ChainSyncConfig,
    messages::GetBlockBy,
    peers::{PeerId, PeerSet},
    sync::{error::FetchError, fast_sync_peers::FastSyncPeerPool, storage::BlockStorage},
};

const LOG_TARGET: &str = "c::cs::sync::msg_fetcher";

const BLOCK_PROCESS_CHAN_SIZE: usize = 1024;
const HEADERS_PROCESS_CHAN_SIZE: usize = 1024;

/// A contiguous block range downloaded by a single worker. `start_header` advances as partial batches arrive.
#[derive(Debug, Clone)]
pub struct FetchBlocksWork {
    pub start_header: BlockHeader,
    pub stop_header: BlockHeader,
}

#[derive(Debug)]
pub struct FetchBlocksResult {
    pub start_height: u64,
    pub stop_height: u64,
    pub result: Result<(), FetchError>,
}

struct BlockMsg {
    peer_id: PeerId,
    block: Arc<Block>,
}

struct HeadersMsg {
    peer_id: PeerId,
    headers: Vec<BlockHeader>,
}

/// Correlates outgoing block and header requests with the responses that arrive asynchronously from peers.
/// Responses nobody is waiting for are dropped.
pub struct MsgFetcher {
    config: ChainSyncConfig,
    peers: Arc<PeerSet>,
    storage: Arc<BlockStorage>,
    sync_peers: Arc<FastSyncPeerPool>,
    block_tx: mpsc::Sender<BlockMsg>,
    block_rx: Mutex<mpsc::Receiver<BlockMsg>>,
    headers_tx: mpsc::Sender<HeadersMsg>,
    headers_rx: Mutex<mpsc::Receiver<HeadersMsg>>,
    blocks_channels: StdMutex<HashMap<PeerId, mpsc::Sender<Vec<Arc<Block>>>>>,
}

impl MsgFetcher {
    pub fn new(
        config: ChainSyncConfig,
        peers: Arc<PeerSet>,
        storage: Arc<BlockStorage>,
        sync_peers: Arc<FastSyncPeerPool>,
    ) -> Self {
        let (block_tx, block_rx) = mpsc::channel(BLOCK_PROCESS_CHAN_SIZE);
        let (headers_tx, headers_rx) = mpsc::channel(HEADERS_PROCESS_CHAN_SIZE);
        Self {
            config,
            peers,
            storage,
            sync_peers,
            block_tx,
            block_rx: Mutex::new(block_rx),
            headers_tx,
            headers_rx: Mutex::new(headers_rx),
            blocks_channels: StdMutex::new(HashMap::new()),
        }
    }

    pub fn sync_peers(&self) -> &Arc<FastSyncPeerPool> {
        &self.sync_peers
    }

    /// Handles a single `Block` message from a peer
    pub fn process_block(&self, peer_id: &PeerId, block: Arc<Block>) {
        let msg = BlockMsg {
            peer_id: peer_id.clone(),
            block,
        };
        if self.block_tx.try_send(msg).is_err() {
            debug!(target: LOG_TARGET, "Block queue is full, dropping block from peer {}", peer_id);
        }
    }

    /// Handles a `Blocks` message from a peer. The batch is only kept if a range request to that peer is pending.
    pub fn process_blocks(&self, peer_id: &PeerId, blocks: Vec<Arc<Block>>) {
        let sender = acquire_lock!(self.blocks_channels).get(peer_id).cloned();
        match sender {
            Some(sender) => {
                if sender.try_send(blocks).is_err() {
                    debug!(target: LOG_TARGET, "Dropping duplicate blocks response from peer {}", peer_id);
                }
            },
            None => trace!(target: LOG_TARGET, "Dropping unsolicited blocks from peer {}", peer_id),
        }
    }

    /// Handles a `Headers` message from a peer
    pub fn process_headers(&self, peer_id: &PeerId, headers: Vec<BlockHeader>) {
        let msg = HeadersMsg {
            peer_id: peer_id.clone(),
            headers,
        };
        if self.headers_tx.try_send(msg).is_err() {
            debug!(target: LOG_TARGET, "Headers queue is full, dropping headers from peer {}", peer_id);
        }
    }

    /// Requests the block at `height` from `peer_id` and waits for the matching response
    pub async fn require_block(&self, peer_id: &PeerId, height: u64) -> Result<Arc<Block>, FetchError> {
        self.peers.get_block(peer_id, GetBlockBy::Height(height)).await?;

        let deadline = Instant::now() + self.config.require_block_timeout;
        let mut block_rx = self.block_rx.lock().await;
        loop {
            match time::timeout_at(deadline, block_rx.recv()).await {
                Ok(Some(msg)) => {
                    if msg.peer_id == *peer_id && msg.block.height() == height {
                        return Ok(msg.block);
                    }
                    trace!(
                        target: LOG_TARGET,
                        "Discarding block #{} from peer {} while waiting for #{} from {}",
                        msg.block.height(),
                        msg.peer_id,
                        height,
                        peer_id
                    );
                },
                Ok(None) => return Err(FetchError::Cancelled),
                Err(_) => return Err(FetchError::Timeout("block")),
            }
        }
    }

    /// Requests the blocks between the first known `locator` hash and `stop_hash` from `peer_id`
    pub async fn require_blocks(
        &self,
        peer_id: &PeerId,
        locator: Vec<BlockHash>,
        stop_hash: BlockHash,
    ) -> Result<Vec<Arc<Block>>, FetchError> {
        let (tx, mut rx) = mpsc::channel(1);
        acquire_lock!(self.blocks_channels).insert(peer_id.clone(), tx.clone());

        let result = match self.peers.get_blocks(peer_id, locator, stop_hash).await {
            Ok(_) => match time::timeout(self.config.require_blocks_timeout, rx.recv()).await {
                Ok(Some(blocks)) => Ok(blocks),
                Ok(None) => Err(FetchError::Cancelled),
                Err(_) => Err(FetchError::Timeout("blocks")),
            },
            Err(err) => Err(err.into()),
        };

        let mut channels = acquire_lock!(self.blocks_channels);
        if channels.get(peer_id).map(|c| c.same_channel(&tx)).unwrap_or(false) {
            channels.remove(peer_id);
        }
        result
    }

    /// Requests a header skeleton from every peer in `peer_ids` and collects the responses. Returns once every peer
    /// that was sent a request has answered or the headers timeout expires.
    pub async fn parallel_fetch_headers(
        &self,
        peer_ids: &[PeerId],
        locator: &[BlockHash],
        stop_hash: BlockHash,
        skip: u64,
    ) -> HashMap<PeerId, Vec<BlockHeader>> {
        let mut pending = HashSet::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            match self
                .peers
                .get_headers(peer_id, locator.to_vec(), stop_hash, skip)
                .await
            {
                Ok(_) => {
                    pending.insert(peer_id.clone());
                },
                Err(err) => warn!(target: LOG_TARGET, "Failed to request headers from peer {}: {}", peer_id, err),
            }
        }

        let mut skeletons = HashMap::with_capacity(pending.len());
        if pending.is_empty() {
            return skeletons;
        }

        let deadline = Instant::now() + self.config.require_headers_timeout;
        let mut headers_rx = self.headers_rx.lock().await;
        while !pending.is_empty() {
            match time::timeout_at(deadline, headers_rx.recv()).await {
                Ok(Some(msg)) => {
                    if pending.remove(&msg.peer_id) {
                        skeletons.insert(msg.peer_id, msg.headers);
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        target: LOG_TARGET,
                        "Timed out waiting for headers from {} peer(s)",
                        pending.len()
                    );
                    break;
                },
            }
        }
        skeletons
    }

    /// Downloads `works` in parallel from the fast sync peer pool, writing each verified batch to storage and
    /// notifying `downloaded`. `downloads_done` is cancelled when this returns. The fetch is abandoned if
    /// `process_stop` is cancelled.
    pub async fn parallel_fetch_blocks(
        self: &Arc<Self>,
        works: Vec<FetchBlocksWork>,
        downloaded: Arc<Notify>,
        downloads_done: CancellationToken,
        process_stop: CancellationToken,
    ) -> Result<(), FetchError> {
        let _downloads_done = downloads_done.drop_guard();
        let num_works = works.len();
        if num_works == 0 {
            return Ok(());
        }

        let close = CancellationToken::new();
        let _close = close.clone().drop_guard();

        let idle_peers = self.sync_peers.select_idle_peers();
        let (peer_tx, peer_rx) = mpsc::channel(idle_peers.len().max(1));
        for peer_id in idle_peers {
            if let Err(err) = peer_tx.try_send(peer_id) {
                self.sync_peers.set_idle(&err.into_inner());
            }
        }
        let peer_rx = Arc::new(Mutex::new(peer_rx));
        let (result_tx, mut result_rx) = mpsc::channel(num_works);
        let work_queue = Arc::new(StdMutex::new(VecDeque::from(works)));

        let num_workers = self.config.max_num_of_parallel_fetch_blocks.min(num_works);
        debug!(
            target: LOG_TARGET,
            "Fetching {} block range(s) with {} worker(s) from {} peer(s)",
            num_works,
            num_workers,
            self.sync_peers.size()
        );
        let mut workers = JoinSet::new();
        for _ in 0..num_workers {
            workers.spawn(self.clone().fetch_blocks_worker(
                work_queue.clone(),
                peer_rx.clone(),
                result_tx.clone(),
                downloaded.clone(),
                close.clone(),
            ));
        }
        drop(result_tx);

        let check_interval = self.config.check_sync_peer_num_interval;
        let mut check_sync_peers = time::interval_at(Instant::now() + check_interval, check_interval);
        let mut num_results = 0;
        let outcome = loop {
            if num_results == num_works {
                break Ok(());
            }
            tokio::select! {
                result = result_rx.recv() => {
                    let result: FetchBlocksResult = match result {
                        Some(result) => result,
                        None => break Err(FetchError::Cancelled),
                    };
                    num_results += 1;
                    if let Err(err) = result.result {
                        error!(
                            target: LOG_TARGET,
                            "Failed to fetch blocks #{} to #{}: {}", result.start_height, result.stop_height, err
                        );
                        break Err(err);
                    }
                    trace!(
                        target: LOG_TARGET,
                        "Fetched blocks #{} to #{} ({}/{})", result.start_height, result.stop_height, num_results, num_works
                    );
                    if let Some(peer_id) = self.sync_peers.select_idle_peer() {
                        if let Err(err) = peer_tx.try_send(peer_id) {
                            self.sync_peers.set_idle(&err.into_inner());
                        }
                    }
                },
                _ = check_sync_peers.tick() => {
                    if self.sync_peers.is_empty() {
                        warn!(target: LOG_TARGET, "Every fast sync peer has been evicted, abandoning block download");
                        break Err(FetchError::SyncPeerPoolExhausted);
                    }
                },
                _ = process_stop.cancelled() => {
                    debug!(target: LOG_TARGET, "Block processor stopped, abandoning block download");
                    break Ok(());
                },
            }
        };

        close.cancel();
        workers.shutdown().await;
        outcome
    }

    async fn fetch_blocks_worker(
        self: Arc<Self>,
        work_queue: Arc<StdMutex<VecDeque<FetchBlocksWork>>>,
        peer_rx: Arc<Mutex<mpsc::Receiver<PeerId>>>,
        result_tx: mpsc::Sender<FetchBlocksResult>,
        downloaded: Arc<Notify>,
        close: CancellationToken,
    ) {
        loop {
            let next = acquire_lock!(work_queue).pop_front();
            let work = match next {
                Some(work) => work,
                None => return,
            };
            let start_height = work.start_header.height;
            let stop_height = work.stop_header.height;
            let result = self.fetch_blocks_process(work, &peer_rx, &downloaded, &close).await;
            if let Err(FetchError::Cancelled) = result {
                return;
            }
            let result = FetchBlocksResult {
                start_height,
                stop_height,
                result,
            };
            if result_tx.send(result).await.is_err() {
                return;
            }
        }
    }

    /// Completes a single work item, switching to another idle peer whenever the current one fails
    async fn fetch_blocks_process(
        &self,
        mut work: FetchBlocksWork,
        peer_rx: &Mutex<mpsc::Receiver<PeerId>>,
        downloaded: &Notify,
        close: &CancellationToken,
    ) -> Result<(), FetchError> {
        loop {
            let peer_id = tokio::select! {
                peer_id = async { peer_rx.lock().await.recv().await } => peer_id.ok_or(FetchError::Cancelled)?,
                _ = close.cancelled() => return Err(FetchError::Cancelled),
            };

            loop {
                let blocks = tokio::select! {
                    blocks = self.fetch_blocks(&work, &peer_id) => blocks,
                    _ = close.cancelled() => return Err(FetchError::Cancelled),
                };
                let blocks = match blocks {
                    Ok(blocks) => blocks,
                    Err(err) => {
                        debug!(
                            target: LOG_TARGET,
                            "Peer {} failed to deliver blocks #{} to #{}: {}",
                            peer_id,
                            work.start_header.height,
                            work.stop_header.height,
                            err
                        );
                        break;
                    },
                };

                self.storage.write_blocks(&peer_id, &blocks)?;
                downloaded.notify_one();

                let last_header = match blocks.last() {
                    Some(block) => block.header.clone(),
                    None => break,
                };
                if last_header.height >= work.stop_header.height {
                    self.sync_peers.set_idle(&peer_id);
                    return Ok(());
                }
                work.start_header = last_header;
            }
        }
    }

    /// Requests the next batch of `work` from `peer_id`. A peer that fails is evicted from the session pool and
    /// reported.
    async fn fetch_blocks(&self, work: &FetchBlocksWork, peer_id: &PeerId) -> Result<Vec<Arc<Block>>, FetchError> {
        let result = self.require_and_verify_blocks(work, peer_id).await;
        if let Err(err) = &result {
            self.sync_peers.delete(peer_id);
            if let Some(level) = err.ban_level() {
                self.peers.process_illegal(peer_id, level, &err.to_string()).await;
            }
        }
        result
    }

    async fn require_and_verify_blocks(
        &self,
        work: &FetchBlocksWork,
        peer_id: &PeerId,
    ) -> Result<Vec<Arc<Block>>, FetchError> {
        let blocks = self
            .require_blocks(peer_id, vec![work.start_header.hash()], work.stop_header.hash())
            .await?;
        verify_blocks_msg(peer_id, &blocks, &work.start_header, &work.stop_header)?;
        if blocks.len() == 1 && work.start_header.height < work.stop_header.height {
            return Err(FetchError::invalid_blocks(
                peer_id,
                format!("no progress past block #{}", work.start_header.height),
            ));
        }
        Ok(blocks)
    }

    /// Forgets every pending request and drops any queued responses
    pub async fn reset_parameter(&self) {
        acquire_lock!(self.blocks_channels).clear();
        let mut block_rx = self.block_rx.lock().await;
        while block_rx.try_recv().is_ok() {}
        let mut headers_rx = self.headers_rx.lock().await;
        while headers_rx.try_recv().is_ok() {}
    }
}

/// Checks that a block batch starts at `start_header`, is linked by hash and fits the requested range
pub fn verify_blocks_msg(
    peer_id: &PeerId,
    blocks: &[Arc<Block>],
    start_header: &BlockHeader,
    stop_header: &BlockHeader,
) -> Result<(), FetchError> {
    let first = blocks
        .first()
        .ok_or_else(|| FetchError::invalid_blocks(peer_id, "empty block batch"))?;

    let max_len = stop_header.height.saturating_sub(start_header.height) + 1;
    if blocks.len() as u64 > max_len {
        return Err(FetchError::invalid_blocks(
            peer_id,
            format!("{} block(s) exceeds requested range of {}", blocks.len(), max_len),
        ));
    }

    if first.hash() != start_header.hash() {
        return Err(FetchError::invalid_blocks(
            peer_id,
            format!("first block {} does not match start {}", first.header, start_header),
        ));
    }

    if let Some(pair) = blocks.windows(2).find(|pair| !pair[0].header.is_parent_of(&pair[1].header)) {
        return Err(FetchError::invalid_blocks(
            peer_id,
            format!("block {} does not extend {}", pair[1].header, pair[0].header),
        ));
    }
    Ok(())
}

impl FetchBlocksWork {
    pub fn new(start_header: BlockHeader, stop_header: BlockHeader) -> Self {
        Self {
            start_header,
            stop_header,
        }
    }

    pub fn num_blocks(&self) -> u64 {
        self.stop_header.height.saturating_sub(self.start_header.height) + 1
    }
}

#[cfg(test)]
mod test {
    use tari_sync_types::Block;

    use super::*;
    use crate::{peers::BanLevel, test_helpers::create_chain};

    fn peer() -> PeerId {
        "peer".into()
    }

    fn assert_illegal(result: Result<(), FetchError>) {
        let err = result.unwrap_err();
        assert!(matches!(err, FetchError::InvalidBlocks { .. }));
        assert_eq!(err.ban_level(), Some(BanLevel::MsgIllegal));
    }

    #[test]
    fn it_accepts_a_linked_batch() {
        let chain = create_chain(10);
        assert!(verify_blocks_msg(&peer(), &chain[2..6], &chain[2].header, &chain[8].header).is_ok());
        assert!(verify_blocks_msg(&peer(), &chain[2..9], &chain[2].header, &chain[8].header).is_ok());
    }

    #[test]
    fn it_rejects_an_empty_batch() {
        let chain = create_chain(10);
        assert_illegal(verify_blocks_msg(&peer(), &[], &chain[2].header, &chain[8].header));
    }

    #[test]
    fn it_rejects_an_oversized_batch() {
        let chain = create_chain(10);
        assert_illegal(verify_blocks_msg(&peer(), &chain[2..8], &chain[2].header, &chain[6].header));
    }

    #[test]
    fn it_rejects_a_batch_with_the_wrong_start() {
        let chain = create_chain(10);
        assert_illegal(verify_blocks_msg(&peer(), &chain[3..6], &chain[2].header, &chain[8].header));
    }

    #[test]
    fn it_rejects_a_broken_link() {
        let chain = create_chain(10);
        let mut blocks = chain[2..6].to_vec();
        blocks.remove(2);
        assert_illegal(verify_blocks_msg(&peer(), &blocks, &chain[2].header, &chain[8].header));
    }

    #[test]
    fn it_rejects_a_linked_block_with_a_forged_height() {
        let chain = create_chain(10);
        let mut header = BlockHeader::from_previous(&chain[2].header);
        header.height = 7;
        let forged = Arc::new(Block::new(header, vec![]));
        let blocks = vec![chain[2].clone(), forged];
        assert_illegal(verify_blocks_msg(&peer(), &blocks, &chain[2].header, &chain[8].header));
    }
}
