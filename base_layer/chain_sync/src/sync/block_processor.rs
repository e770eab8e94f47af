// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;

use log::*;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{BlockAddResult, Chain},
    peers::{BanLevel, PeerSet},
    sync::{error::FastSyncError, storage::BlockStorage},
};

const LOG_TARGET: &str = "c::cs::sync::block_processor";

/// Applies downloaded blocks to the chain strictly in height order
pub struct BlockProcessor {
    chain: Arc<dyn Chain>,
    storage: Arc<BlockStorage>,
    peers: Arc<PeerSet>,
}

impl BlockProcessor {
    pub fn new(chain: Arc<dyn Chain>, storage: Arc<BlockStorage>, peers: Arc<PeerSet>) -> Self {
        Self { chain, storage, peers }
    }

    /// Applies buffered blocks from `sync_height` upwards, waiting on `downloaded` whenever the next height has not
    /// arrived yet. Remaining blocks are drained once `downloads_done` is cancelled. `process_stop` is cancelled when
    /// this returns. Returns the height of the next block that was not applied.
    pub async fn process(
        &self,
        downloaded: Arc<Notify>,
        downloads_done: CancellationToken,
        process_stop: CancellationToken,
        mut sync_height: u64,
    ) -> Result<u64, FastSyncError> {
        let _process_stop = process_stop.drop_guard();
        loop {
            while self.process_block(sync_height).await? {
                sync_height += 1;
            }
            if downloads_done.is_cancelled() {
                debug!(target: LOG_TARGET, "Downloads done, stopped processing at block #{}", sync_height);
                return Ok(sync_height);
            }
            tokio::select! {
                _ = downloaded.notified() => {},
                _ = downloads_done.cancelled() => {},
            }
        }
    }

    /// Applies the block at `height` if it has been downloaded. Returns false if it is not available yet.
    async fn process_block(&self, height: u64) -> Result<bool, FastSyncError> {
        let stored = match self.storage.read_block(height)? {
            Some(stored) => stored,
            None => return Ok(false),
        };

        match self.chain.process_block(stored.block.clone()).await {
            Ok(BlockAddResult::OrphanBlock) => {
                self.peers
                    .process_illegal(&stored.peer_id, BanLevel::MsgIllegal, "orphan block during fast sync")
                    .await;
                return Err(FastSyncError::OrphanBlock {
                    height,
                    peer: stored.peer_id,
                });
            },
            Ok(result) => {
                trace!(target: LOG_TARGET, "Block #{} processed: {:?}", height, result);
            },
            Err(err) => {
                self.peers
                    .process_illegal(&stored.peer_id, BanLevel::MsgIllegal, &err.to_string())
                    .await;
                return Err(FastSyncError::BlockRejected {
                    height,
                    peer: stored.peer_id,
                    source: err,
                });
            },
        }

        self.storage.delete_block(height);
        Ok(true)
    }
}
