// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! The chain state the sync process reads from and writes to. Validation and consensus live behind this trait.

use std::sync::Arc;

use async_trait::async_trait;
use tari_sync_types::{Block, BlockHash, BlockHeader, Transaction};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("The requested {entity} was not found via {field}:{value} in the database")]
    ValueNotFound {
        entity: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Chain access error: {0}")]
    AccessError(String),
}

impl ChainError {
    pub fn is_value_not_found(&self) -> bool {
        matches!(self, ChainError::ValueNotFound { .. })
    }
}

/// The outcome of adding a block to the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAddResult {
    /// The block was accepted
    Ok,
    /// The block was already known
    BlockExists,
    /// The parent of the block is not known
    OrphanBlock,
}

impl BlockAddResult {
    pub fn is_orphan(&self) -> bool {
        matches!(self, BlockAddResult::OrphanBlock)
    }
}

#[async_trait]
pub trait Chain: Send + Sync + 'static {
    async fn best_block_height(&self) -> Result<u64, ChainError>;

    async fn best_block_header(&self) -> Result<BlockHeader, ChainError>;

    /// The highest header the local chain considers irreversible
    async fn last_justified_header(&self) -> Result<BlockHeader, ChainError>;

    async fn get_block_by_height(&self, height: u64) -> Result<Block, ChainError>;

    async fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Block, ChainError>;

    async fn get_header_by_height(&self, height: u64) -> Result<BlockHeader, ChainError>;

    async fn get_header_by_hash(&self, hash: &BlockHash) -> Result<BlockHeader, ChainError>;

    async fn in_main_chain(&self, hash: &BlockHash) -> Result<bool, ChainError>;

    async fn process_block(&self, block: Arc<Block>) -> Result<BlockAddResult, ChainError>;

    /// Validates a transaction received from a peer. Returns `true` if the transaction spends unknown outputs.
    async fn validate_tx(&self, tx: &Transaction) -> Result<bool, ChainError>;
}
