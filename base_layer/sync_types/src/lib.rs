// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! Value types exchanged between the chain synchronisation components and the rest of the node.
//!
//! Headers and blocks are immutable once received. Hashes are derived from the consensus fields of the header and
//! are never trusted from the wire.

mod block;
mod block_header;
mod fixed_hash;
mod transaction;

pub use block::Block;
pub use block_header::BlockHeader;
pub use fixed_hash::{FixedHash, FixedHashSizeError};
pub use transaction::Transaction;

/// Hash of a block header
pub type BlockHash = FixedHash;
