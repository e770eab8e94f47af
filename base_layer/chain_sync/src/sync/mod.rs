// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

mod block_keeper;
pub use block_keeper::{locate_blocks, locate_headers, BlockKeeper, SyncType};

mod block_processor;
pub use block_processor::BlockProcessor;

mod error;
pub use error::{BlockKeeperError, FastSyncError, FetchError};

mod fast_sync;
pub use fast_sync::{block_locator, FastSync};

mod fast_sync_peers;
pub use fast_sync_peers::FastSyncPeerPool;

mod msg_fetcher;
pub use msg_fetcher::{verify_blocks_msg, FetchBlocksResult, FetchBlocksWork, MsgFetcher};

pub mod storage;
