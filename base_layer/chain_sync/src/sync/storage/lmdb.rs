// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{fs, path::Path, sync::Arc};

use lmdb_zero as lmdb;
use lmdb_zero::error::LmdbResultExt;
use log::*;
use tari_sync_types::Block;

use crate::sync::storage::{LocalStore, SyncStorageError};

const LOG_TARGET: &str = "c::cs::sync::storage::lmdb";
const LMDB_DB_FAST_SYNC_BLOCKS: &str = "fast_sync_blocks";

/// Disk tier of the fast sync block buffer. Blocks are keyed by big-endian height so that keys sort by height.
pub struct LmdbBlockStore {
    env: Arc<lmdb::Environment>,
    db: lmdb::Database<'static>,
}

impl LmdbBlockStore {
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, SyncStorageError> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| SyncStorageError::InvalidPath(path.to_string_lossy().to_string()))?;
        let env = unsafe {
            let mut builder = lmdb::EnvBuilder::new()?;
            builder.set_mapsize(map_size_mb * 1024 * 1024)?;
            builder.set_maxdbs(1)?;
            builder.open(path_str, lmdb::open::Flags::empty(), 0o600)?
        };
        let env = Arc::new(env);
        let db = lmdb::Database::open(
            env.clone(),
            Some(LMDB_DB_FAST_SYNC_BLOCKS),
            &lmdb::DatabaseOptions::new(lmdb::db::CREATE),
        )?;
        debug!(
            target: LOG_TARGET,
            "Opened fast sync block store at {} ({} MB)", path_str, map_size_mb
        );
        Ok(Self { env, db })
    }
}

fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

impl LocalStore for LmdbBlockStore {
    fn write_block(&self, block: &Block) -> Result<(), SyncStorageError> {
        let value = bincode::serialize(block)?;
        let txn = lmdb::WriteTransaction::new(self.env.clone())?;
        {
            let mut access = txn.access();
            access.put(&self.db, &height_key(block.height())[..], &value[..], lmdb::put::Flags::empty())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn read_block(&self, height: u64) -> Result<Option<Block>, SyncStorageError> {
        let txn = lmdb::ReadTransaction::new(self.env.clone())?;
        let access = txn.access();
        match access.get::<[u8], [u8]>(&self.db, &height_key(height)[..]).to_opt()? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    fn clear_data(&self) -> Result<(), SyncStorageError> {
        let txn = lmdb::WriteTransaction::new(self.env.clone())?;
        {
            let mut access = txn.access();
            access.clear_db(&self.db)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tari_sync_types::{BlockHeader, Transaction};
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn it_writes_reads_and_clears_blocks() {
        let dir = tempdir().unwrap();
        let store = LmdbBlockStore::open(dir.path(), 16).unwrap();
        let genesis = BlockHeader::genesis(0);
        let block = Block::new(BlockHeader::from_previous(&genesis), vec![Transaction::new(vec![1, 2, 3])]);

        assert!(store.read_block(1).unwrap().is_none());
        store.write_block(&block).unwrap();
        assert_eq!(store.read_block(1).unwrap(), Some(block));
        assert!(store.read_block(0).unwrap().is_none());

        store.clear_data().unwrap();
        assert!(store.read_block(1).unwrap().is_none());
        // Clearing an empty store is fine
        store.clear_data().unwrap();
    }
}
