// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! Buffer for blocks downloaded by fast sync. Blocks are kept in memory while they fit in the configured budget and
//! spill to a disk-backed store otherwise.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::*;
use tari_sync_types::Block;

use crate::peers::PeerId;

mod error;
pub use error::SyncStorageError;

mod lmdb;
pub use lmdb::LmdbBlockStore;

const LOG_TARGET: &str = "c::cs::sync::storage";

/// Persistent store backing the disk tier
pub trait LocalStore: Send + Sync {
    fn write_block(&self, block: &Block) -> Result<(), SyncStorageError>;

    fn read_block(&self, height: u64) -> Result<Option<Block>, SyncStorageError>;

    fn clear_data(&self) -> Result<(), SyncStorageError>;
}

/// A buffered block and the peer that supplied it
#[derive(Debug, Clone)]
pub struct StoredBlock {
    pub block: Arc<Block>,
    pub peer_id: PeerId,
}

struct StorageEntry {
    /// `None` when the block lives on disk
    block: Option<Arc<Block>>,
    peer_id: PeerId,
    size: usize,
    is_ram: bool,
}

#[derive(Default)]
struct StorageState {
    actual_usage: usize,
    blocks: HashMap<u64, StorageEntry>,
}

impl StorageState {
    fn remove(&mut self, height: u64) {
        if let Some(old) = self.blocks.remove(&height) {
            if old.is_ram {
                self.actual_usage -= old.size;
            }
        }
    }
}

pub struct BlockStorage {
    state: Mutex<StorageState>,
    local_store: Arc<dyn LocalStore>,
    max_ram_bytes: usize,
}

impl BlockStorage {
    pub fn new(local_store: Arc<dyn LocalStore>, max_ram_bytes: usize) -> Self {
        Self {
            state: Mutex::new(StorageState::default()),
            local_store,
            max_ram_bytes,
        }
    }

    /// Buffers `blocks` received from `peer_id`, replacing any block already buffered at the same height.
    pub fn write_blocks(&self, peer_id: &PeerId, blocks: &[Arc<Block>]) -> Result<(), SyncStorageError> {
        let mut state = acquire_lock!(self.state);
        for block in blocks {
            let height = block.height();
            let size = block.serialized_size()?;
            state.remove(height);

            if state.actual_usage + size < self.max_ram_bytes {
                state.blocks.insert(height, StorageEntry {
                    block: Some(block.clone()),
                    peer_id: peer_id.clone(),
                    size,
                    is_ram: true,
                });
                state.actual_usage += size;
                continue;
            }

            self.local_store.write_block(block)?;
            trace!(
                target: LOG_TARGET,
                "RAM budget reached ({} bytes), block #{} written to disk",
                state.actual_usage,
                height
            );
            state.blocks.insert(height, StorageEntry {
                block: None,
                peer_id: peer_id.clone(),
                size,
                is_ram: false,
            });
        }
        Ok(())
    }

    /// Returns the buffered block at `height`, reading it back from disk if necessary.
    pub fn read_block(&self, height: u64) -> Result<Option<StoredBlock>, SyncStorageError> {
        let state = acquire_lock!(self.state);
        let entry = match state.blocks.get(&height) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let block = match &entry.block {
            Some(block) if entry.is_ram => block.clone(),
            _ => {
                let block = self
                    .local_store
                    .read_block(height)?
                    .ok_or(SyncStorageError::MissingDiskBlock(height))?;
                Arc::new(block)
            },
        };
        Ok(Some(StoredBlock {
            block,
            peer_id: entry.peer_id.clone(),
        }))
    }

    /// Releases the in-memory copy of the block at `height`. Disk entries are only released by a reset.
    pub fn delete_block(&self, height: u64) {
        let mut state = acquire_lock!(self.state);
        if state.blocks.get(&height).map(|e| e.is_ram).unwrap_or(false) {
            state.remove(height);
        }
    }

    /// Drops every buffered block, in memory and on disk.
    pub fn reset_parameter(&self) -> Result<(), SyncStorageError> {
        let mut state = acquire_lock!(self.state);
        state.blocks.clear();
        state.actual_usage = 0;
        self.local_store.clear_data()
    }

    /// Bytes of block data currently held in memory
    pub fn actual_usage(&self) -> usize {
        acquire_lock!(self.state).actual_usage
    }

    pub fn len(&self) -> usize {
        acquire_lock!(self.state).blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use tari_sync_types::Transaction;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::test_helpers::create_chain;

    fn blocks_with_payload(n: u64) -> Vec<Arc<Block>> {
        create_chain(n)
            .into_iter()
            .map(|mut b| {
                Arc::make_mut(&mut b).transactions.push(Transaction::new(vec![0u8; 100]));
                b
            })
            .collect()
    }

    fn storage(max_ram_bytes: usize) -> (BlockStorage, TempDir) {
        let dir = tempdir().unwrap();
        let store = LmdbBlockStore::open(dir.path(), 16).unwrap();
        (BlockStorage::new(Arc::new(store), max_ram_bytes), dir)
    }

    fn ram_sum(storage: &BlockStorage) -> usize {
        let state = storage.state.lock().unwrap();
        state.blocks.values().filter(|e| e.is_ram).map(|e| e.size).sum()
    }

    #[test]
    fn it_spills_to_disk_when_ram_budget_is_exceeded() {
        let blocks = blocks_with_payload(10);
        let block_size = blocks[1].serialized_size().unwrap();
        let (storage, _dir) = storage(block_size * 3 + 1);
        storage.write_blocks(&"peer".into(), &blocks[1..]).unwrap();

        assert_eq!(storage.len(), 9);
        assert_eq!(storage.actual_usage(), ram_sum(&storage));
        assert!(storage.actual_usage() <= block_size * 3 + 1);
        {
            let state = storage.state.lock().unwrap();
            assert_eq!(state.blocks.values().filter(|e| e.is_ram).count(), 3);
            assert!(state.blocks.values().filter(|e| !e.is_ram).all(|e| e.block.is_none()));
        }

        for height in 1..10 {
            let stored = storage.read_block(height).unwrap().unwrap();
            assert_eq!(stored.block.hash(), blocks[height as usize].hash());
            assert_eq!(stored.peer_id.as_str(), "peer");
        }
        assert!(storage.read_block(10).unwrap().is_none());
    }

    #[test]
    fn it_keeps_usage_consistent_across_deletes_and_overwrites() {
        let blocks = blocks_with_payload(6);
        let block_size = blocks[1].serialized_size().unwrap();
        let (storage, _dir) = storage(block_size * 4 + 1);
        storage.write_blocks(&"a".into(), &blocks[1..4]).unwrap();
        // Overwriting a height must not double count it
        storage.write_blocks(&"b".into(), &blocks[2..6]).unwrap();
        assert_eq!(storage.actual_usage(), ram_sum(&storage));
        assert_eq!(storage.read_block(2).unwrap().unwrap().peer_id.as_str(), "b");

        storage.delete_block(1);
        storage.delete_block(2);
        storage.delete_block(42);
        assert_eq!(storage.actual_usage(), ram_sum(&storage));
        assert!(storage.read_block(1).unwrap().is_none());
        assert!(storage.actual_usage() <= block_size * 4 + 1);
    }

    #[test]
    fn delete_leaves_disk_entries_in_place() {
        let blocks = blocks_with_payload(3);
        let (storage, _dir) = storage(1);
        storage.write_blocks(&"a".into(), &blocks[1..]).unwrap();
        assert_eq!(storage.actual_usage(), 0);
        storage.delete_block(1);
        assert!(storage.read_block(1).unwrap().is_some());
    }

    #[test]
    fn reset_is_idempotent() {
        let blocks = blocks_with_payload(5);
        let block_size = blocks[1].serialized_size().unwrap();
        let (storage, _dir) = storage(block_size * 2 + 1);
        storage.write_blocks(&"a".into(), &blocks[1..]).unwrap();

        storage.reset_parameter().unwrap();
        assert!(storage.is_empty());
        assert_eq!(storage.actual_usage(), 0);
        storage.reset_parameter().unwrap();
        assert!(storage.is_empty());
        assert_eq!(storage.actual_usage(), 0);
        for height in 1..5 {
            assert!(storage.read_block(height).unwrap().is_none());
        }
    }
}
