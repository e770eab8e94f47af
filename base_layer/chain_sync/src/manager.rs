// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::{Arc, Mutex};

use log::*;
use tari_sync_types::{BlockHash, Transaction};
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{Chain, ChainError},
    config::{ChainSyncConfig, ChainSyncConfigError},
    messages::{ChainMessage, ChainStatus, GetBlockBy},
    peers::{BanLevel, PeerId, PeerNetwork, PeerNetworkError, PeerSet, ServiceFlags},
    sync::{
        locate_blocks,
        locate_headers,
        storage::{BlockStorage, LmdbBlockStore, LocalStore, SyncStorageError},
        BlockKeeper,
    },
};

const LOG_TARGET: &str = "c::cs::manager";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ChainSyncConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] SyncStorageError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Peer network error: {0}")]
    PeerNetwork(#[from] PeerNetworkError),
}

/// Owns the sync loop, tracks peer connections and dispatches chain sync messages
pub struct Manager {
    config: ChainSyncConfig,
    chain: Arc<dyn Chain>,
    peers: Arc<PeerSet>,
    block_keeper: Arc<BlockKeeper>,
    shutdown: CancellationToken,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Creates a manager whose fast sync disk buffer lives in an LMDB environment at `config.fast_sync_db_path`
    pub fn new(
        config: ChainSyncConfig,
        chain: Arc<dyn Chain>,
        network: Arc<dyn PeerNetwork>,
    ) -> Result<Arc<Self>, ManagerError> {
        config.validate()?;
        let local_store = LmdbBlockStore::open(&config.fast_sync_db_path, config.fast_sync_db_map_size_mb)?;
        Self::with_local_store(config, chain, network, Arc::new(local_store))
    }

    pub fn with_local_store(
        config: ChainSyncConfig,
        chain: Arc<dyn Chain>,
        network: Arc<dyn PeerNetwork>,
        local_store: Arc<dyn LocalStore>,
    ) -> Result<Arc<Self>, ManagerError> {
        config.validate()?;
        let peers = Arc::new(PeerSet::new(&config, network));
        let storage = Arc::new(BlockStorage::new(local_store, config.max_byte_of_storage_ram));
        let block_keeper = Arc::new(BlockKeeper::new(config.clone(), chain.clone(), peers.clone(), storage));
        Ok(Arc::new(Self {
            config,
            chain,
            peers,
            block_keeper,
            shutdown: CancellationToken::new(),
            sync_task: Mutex::new(None),
        }))
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn block_keeper(&self) -> &Arc<BlockKeeper> {
        &self.block_keeper
    }

    /// Registers a newly connected peer and sends it our chain status
    pub async fn add_peer(&self, peer_id: PeerId, services: ServiceFlags) -> Result<(), ManagerError> {
        if !self.peers.add_peer(peer_id.clone(), services) {
            return Ok(());
        }
        if let Err(err) = self.send_status(&peer_id).await {
            warn!(target: LOG_TARGET, "Failed to send status to new peer {}: {}", peer_id, err);
            self.peers.remove_peer(&peer_id);
            return Err(err);
        }
        Ok(())
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.peers.remove_peer(peer_id);
    }

    /// The local chain status as advertised to peers
    pub async fn local_status(&self) -> Result<ChainStatus, ChainError> {
        let best = self.chain.best_block_header().await?;
        let justified = self.chain.last_justified_header().await?;
        Ok(ChainStatus::new(&best, &justified))
    }

    pub async fn send_status(&self, peer_id: &PeerId) -> Result<(), ManagerError> {
        let status = self.local_status().await?;
        self.peers.send_message(peer_id, ChainMessage::Status(status)).await?;
        Ok(())
    }

    /// True if no connected full node claims a higher best height than the local chain
    pub async fn is_caught_up(&self) -> Result<bool, ChainError> {
        let best_height = self.chain.best_block_height().await?;
        Ok(self
            .peers
            .best_peer(ServiceFlags::FULL_NODE)
            .map(|peer| peer.height() <= best_height)
            .unwrap_or(true))
    }

    /// Handles a message received from `peer_id`. Messages from peers that are not connected are ignored.
    pub async fn handle_message(&self, peer_id: &PeerId, msg: ChainMessage) {
        if !self.peers.contains(peer_id) {
            debug!(
                target: LOG_TARGET,
                "Ignoring {} message from unknown peer {}",
                msg.as_type_str(),
                peer_id
            );
            return;
        }
        trace!(target: LOG_TARGET, "Received {} from peer {}", msg, peer_id);

        match msg {
            ChainMessage::GetBlock(by) => self.handle_get_block(peer_id, by).await,
            ChainMessage::Block(block) => self.block_keeper.msg_fetcher().process_block(peer_id, block),
            ChainMessage::GetHeaders {
                locator,
                stop_hash,
                skip,
            } => self.handle_get_headers(peer_id, locator, stop_hash, skip).await,
            ChainMessage::Headers(headers) => self.block_keeper.msg_fetcher().process_headers(peer_id, headers),
            ChainMessage::GetBlocks { locator, stop_hash } => self.handle_get_blocks(peer_id, locator, stop_hash).await,
            ChainMessage::Blocks(blocks) => self.block_keeper.msg_fetcher().process_blocks(peer_id, blocks),
            ChainMessage::Status(status) => {
                self.peers.set_status(peer_id, &status);
            },
            ChainMessage::Transaction(tx) => self.handle_transaction(peer_id, tx).await,
        }
    }

    async fn handle_get_block(&self, peer_id: &PeerId, by: GetBlockBy) {
        let result = match by {
            GetBlockBy::Height(height) => self.chain.get_block_by_height(height).await,
            GetBlockBy::Hash(hash) => self.chain.get_block_by_hash(&hash).await,
        };
        match result {
            Ok(block) => self.reply(peer_id, ChainMessage::Block(Arc::new(block))).await,
            Err(err) => debug!(target: LOG_TARGET, "Peer {} requested block by {}: {}", peer_id, by, err),
        }
    }

    async fn handle_get_headers(&self, peer_id: &PeerId, locator: Vec<BlockHash>, stop_hash: BlockHash, skip: u64) {
        match locate_headers(
            self.chain.as_ref(),
            &locator,
            &stop_hash,
            skip,
            self.config.max_num_of_headers_per_msg,
        )
        .await
        {
            Ok(headers) => self.reply(peer_id, ChainMessage::Headers(headers)).await,
            Err(err) => debug!(target: LOG_TARGET, "Failed to locate headers for peer {}: {}", peer_id, err),
        }
    }

    async fn handle_get_blocks(&self, peer_id: &PeerId, locator: Vec<BlockHash>, stop_hash: BlockHash) {
        let deadline = Instant::now() + self.config.serve_blocks_timeout;
        let blocks = match locate_blocks(
            self.chain.as_ref(),
            &locator,
            &stop_hash,
            self.config.max_num_of_blocks_per_msg,
            deadline,
        )
        .await
        {
            Ok(blocks) if !blocks.is_empty() => blocks,
            Ok(_) => return,
            Err(err) => {
                debug!(target: LOG_TARGET, "Failed to locate blocks for peer {}: {}", peer_id, err);
                return;
            },
        };

        let max_size = self.config.max_blockchain_response_size / 2;
        let mut total_size = 0;
        let mut response = Vec::with_capacity(blocks.len());
        for block in blocks {
            let size = match block.serialized_size() {
                Ok(size) => size,
                Err(err) => {
                    error!(target: LOG_TARGET, "Failed to size block {}: {}", block.header, err);
                    return;
                },
            };
            if !response.is_empty() && total_size + size > max_size {
                break;
            }
            total_size += size;
            response.push(block);
        }
        self.reply(peer_id, ChainMessage::Blocks(response)).await;
    }

    async fn handle_transaction(&self, peer_id: &PeerId, tx: Transaction) {
        match self.chain.validate_tx(&tx).await {
            Ok(is_orphan) => trace!(
                target: LOG_TARGET,
                "Transaction {} from peer {} validated (orphan: {})",
                tx.hash(),
                peer_id,
                is_orphan
            ),
            Err(err) => {
                self.peers
                    .process_illegal(peer_id, BanLevel::MsgIllegal, &err.to_string())
                    .await
            },
        }
    }

    async fn reply(&self, peer_id: &PeerId, msg: ChainMessage) {
        if let Err(err) = self.peers.send_message(peer_id, msg).await {
            warn!(target: LOG_TARGET, "Failed to reply to peer {}: {}", peer_id, err);
            self.peers.remove_peer(peer_id);
        }
    }

    async fn broadcast_status(&self) {
        match self.local_status().await {
            Ok(status) => self.peers.broadcast_status(&status).await,
            Err(err) => error!(target: LOG_TARGET, "Failed to read local chain status: {}", err),
        }
    }

    /// Starts the sync loop. Calling this while the loop is running has no effect.
    pub fn spawn(self: &Arc<Self>) {
        let mut sync_task = acquire_lock!(self.sync_task);
        if sync_task.is_some() {
            return;
        }
        *sync_task = Some(tokio::spawn(self.clone().sync_loop(self.shutdown.clone())));
    }

    /// Stops the sync loop and waits for the current cycle to unwind
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let sync_task = acquire_lock!(self.sync_task).take();
        if let Some(task) = sync_task {
            if let Err(err) = task.await {
                error!(target: LOG_TARGET, "Sync loop ended abnormally: {}", err);
            }
        }
    }

    async fn sync_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let cycle = self.config.sync_cycle;
        let mut ticker = time::interval_at(Instant::now() + cycle, cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: LOG_TARGET, "Chain sync started with a {:.0?} cycle", cycle);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown.cancelled() => break,
            }
            let made_progress = tokio::select! {
                made_progress = self.block_keeper.start_sync() => made_progress,
                _ = shutdown.cancelled() => break,
            };
            if made_progress {
                self.broadcast_status().await;
            }
        }
        info!(target: LOG_TARGET, "Chain sync stopped");
    }
}
