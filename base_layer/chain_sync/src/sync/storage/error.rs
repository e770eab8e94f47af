// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncStorageError {
    #[error("LMDB error: {0}")]
    Lmdb(#[from] lmdb_zero::error::Error),
    #[error("Failed to (de)serialise block: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
    #[error("Block at height {0} is indexed on disk but could not be read back")]
    MissingDiskBlock(u64),
}
