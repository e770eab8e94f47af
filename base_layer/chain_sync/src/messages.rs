// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tari_sync_types::{Block, BlockHash, BlockHeader, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetBlockBy {
    Height(u64),
    Hash(BlockHash),
}

impl Display for GetBlockBy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GetBlockBy::Height(height) => write!(f, "height {}", height),
            GetBlockBy::Hash(hash) => write!(f, "hash {}", hash),
        }
    }
}

/// The chain state a node advertises to its peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub best_height: u64,
    pub best_hash: BlockHash,
    pub justified_height: u64,
    pub justified_hash: BlockHash,
}

impl ChainStatus {
    pub fn new(best: &BlockHeader, justified: &BlockHeader) -> Self {
        Self {
            best_height: best.height,
            best_hash: best.hash(),
            justified_height: justified.height,
            justified_hash: justified.hash(),
        }
    }
}

/// Messages exchanged by the chain sync protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainMessage {
    GetBlock(GetBlockBy),
    Block(Arc<Block>),
    GetHeaders {
        locator: Vec<BlockHash>,
        stop_hash: BlockHash,
        skip: u64,
    },
    Headers(Vec<BlockHeader>),
    GetBlocks {
        locator: Vec<BlockHash>,
        stop_hash: BlockHash,
    },
    Blocks(Vec<Arc<Block>>),
    Status(ChainStatus),
    Transaction(Transaction),
}

impl ChainMessage {
    pub fn as_type_str(&self) -> &'static str {
        match self {
            ChainMessage::GetBlock(_) => "GetBlock",
            ChainMessage::Block(_) => "Block",
            ChainMessage::GetHeaders { .. } => "GetHeaders",
            ChainMessage::Headers(_) => "Headers",
            ChainMessage::GetBlocks { .. } => "GetBlocks",
            ChainMessage::Blocks(_) => "Blocks",
            ChainMessage::Status(_) => "Status",
            ChainMessage::Transaction(_) => "Transaction",
        }
    }
}

impl Display for ChainMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainMessage::GetBlock(by) => write!(f, "GetBlock({})", by),
            ChainMessage::Block(block) => write!(f, "Block({})", block.header),
            ChainMessage::GetHeaders { locator, skip, .. } => {
                write!(f, "GetHeaders(locator: {}, skip: {})", locator.len(), skip)
            },
            ChainMessage::Headers(headers) => write!(f, "Headers({})", headers.len()),
            ChainMessage::GetBlocks { locator, .. } => write!(f, "GetBlocks(locator: {})", locator.len()),
            ChainMessage::Blocks(blocks) => write!(f, "Blocks({})", blocks.len()),
            ChainMessage::Status(status) => write!(
                f,
                "Status(best: {}, justified: {})",
                status.best_height, status.justified_height
            ),
            ChainMessage::Transaction(tx) => write!(f, "Transaction({})", tx.hash()),
        }
    }
}
