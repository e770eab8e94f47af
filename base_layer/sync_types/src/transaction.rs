// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::FixedHash;

/// An opaque, already-serialised transaction. Interpretation is left to the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u16,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { version: 1, payload }
    }

    pub fn hash(&self) -> FixedHash {
        let digest = Sha256::new()
            .chain_update(self.version.to_le_bytes())
            .chain_update(&self.payload)
            .finalize();
        let mut buf = [0u8; FixedHash::byte_size()];
        buf.copy_from_slice(digest.as_slice());
        buf.into()
    }
}
