// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{BlockHash, FixedHash};

/// The consensus fields of a block. The block hash commits to every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u16,
    pub height: u64,
    pub prev_hash: BlockHash,
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
    pub transaction_root: FixedHash,
    pub bits: u64,
    pub nonce: u64,
}

impl BlockHeader {
    /// Creates an empty header at height 0 that commits to no parent.
    pub fn genesis(timestamp: u64) -> Self {
        Self {
            version: 1,
            height: 0,
            prev_hash: FixedHash::zero(),
            timestamp,
            transaction_root: FixedHash::zero(),
            bits: 0,
            nonce: 0,
        }
    }

    /// Creates a header that extends `prev`.
    pub fn from_previous(prev: &BlockHeader) -> Self {
        Self {
            version: prev.version,
            height: prev.height + 1,
            prev_hash: prev.hash(),
            timestamp: prev.timestamp,
            transaction_root: FixedHash::zero(),
            bits: prev.bits,
            nonce: 0,
        }
    }

    pub fn hash(&self) -> BlockHash {
        let digest = Sha256::new()
            .chain_update(self.version.to_le_bytes())
            .chain_update(self.height.to_le_bytes())
            .chain_update(self.prev_hash.as_slice())
            .chain_update(self.timestamp.to_le_bytes())
            .chain_update(self.transaction_root.as_slice())
            .chain_update(self.bits.to_le_bytes())
            .chain_update(self.nonce.to_le_bytes())
            .finalize();
        let mut buf = [0u8; FixedHash::byte_size()];
        buf.copy_from_slice(digest.as_slice());
        buf.into()
    }

    /// True if `child` links to this header by hash and sits exactly one height above it
    pub fn is_parent_of(&self, child: &BlockHeader) -> bool {
        child.height == self.height.saturating_add(1) && child.prev_hash == self.hash()
    }
}

impl Display for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.height, self.hash())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_commits_to_all_fields() {
        let header = BlockHeader::genesis(1_600_000_000_000);
        let mut other = header.clone();
        other.nonce = 1;
        assert_ne!(header.hash(), other.hash());
        let mut other = header.clone();
        other.transaction_root = FixedHash::from([1u8; 32]);
        assert_ne!(header.hash(), other.hash());
        assert_eq!(header.hash(), header.clone().hash());
    }

    #[test]
    fn from_previous_links_to_parent() {
        let genesis = BlockHeader::genesis(0);
        let child = BlockHeader::from_previous(&genesis);
        assert_eq!(child.height, 1);
        assert!(genesis.is_parent_of(&child));
        assert!(!child.is_parent_of(&genesis));
    }

    #[test]
    fn parent_link_requires_consecutive_heights() {
        let genesis = BlockHeader::genesis(0);
        let mut child = BlockHeader::from_previous(&genesis);
        child.height = 7;
        assert_eq!(child.prev_hash, genesis.hash());
        assert!(!genesis.is_parent_of(&child));
    }
}
