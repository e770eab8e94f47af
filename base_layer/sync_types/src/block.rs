// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{BlockHash, BlockHeader, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn prev_hash(&self) -> &BlockHash {
        &self.header.prev_hash
    }

    /// The number of bytes this block occupies when encoded for storage or the wire
    #[allow(clippy::cast_possible_truncation)]
    pub fn serialized_size(&self) -> Result<usize, bincode::Error> {
        bincode::serialized_size(self).map(|sz| sz as usize)
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block {} ({} transaction(s))", self.header, self.transactions.len())
    }
}
