// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! Chain synchronisation for the base node.
//!
//! Every sync cycle the [Manager](crate::Manager) asks the block keeper to compare the local chain with the connected
//! peers. A small gap is closed by regular sync, which requests one block at a time from the best peer. A large gap
//! behind a peer's justified (irreversible) height is closed by fast sync:
//!
//! 1. A header skeleton (headers spaced a fixed distance apart) is requested from every peer that is tall enough.
//! 2. Peers whose skeleton matches the reference peer's form the session pool.
//! 3. The skeleton is split into block ranges that a bounded pool of workers downloads in parallel.
//! 4. Downloaded blocks are buffered in a two-tier (RAM + LMDB) storage and applied to the chain strictly in height
//!    order.

#[macro_use]
mod macros;

pub mod chain;
pub mod config;
pub mod messages;
pub mod peers;
pub mod serializers;
pub mod sync;
#[cfg(any(test, feature = "test_helpers"))]
pub mod test_helpers;

mod manager;
pub use manager::{Manager, ManagerError};
