// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use thiserror::Error;

use crate::{
    chain::ChainError,
    peers::{BanLevel, PeerId, PeerNetworkError},
    sync::storage::SyncStorageError,
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Peer network error: {0}")]
    PeerNetwork(#[from] PeerNetworkError),
    #[error("Peer {peer} sent an invalid block batch: {details}")]
    InvalidBlocks { peer: PeerId, details: String },
    #[error("The fast sync peer pool is exhausted")]
    SyncPeerPoolExhausted,
    #[error("Fetch was cancelled")]
    Cancelled,
    #[error("Storage error: {0}")]
    Storage(#[from] SyncStorageError),
}

impl FetchError {
    pub fn invalid_blocks<T: Into<String>>(peer: &PeerId, details: T) -> Self {
        FetchError::InvalidBlocks {
            peer: peer.clone(),
            details: details.into(),
        }
    }

    /// The severity with which a peer that caused this error is reported, if it is reported at all
    pub fn ban_level(&self) -> Option<BanLevel> {
        match self {
            FetchError::Timeout(_) | FetchError::PeerNetwork(_) => Some(BanLevel::ConnException),
            FetchError::InvalidBlocks { .. } => Some(BanLevel::MsgIllegal),
            FetchError::SyncPeerPoolExhausted | FetchError::Cancelled | FetchError::Storage(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FastSyncError {
    #[error("No peer is tall enough to serve the fast sync range")]
    NoSyncPeer,
    #[error("No peer returned a header skeleton")]
    NoSkeletonFound,
    #[error("The reference peer did not return a header skeleton")]
    NoMainSkeleton,
    #[error("Skeleton of {actual} header(s) from peer {peer} is shorter than the minimum of {min}")]
    SkeletonSize { peer: PeerId, actual: usize, min: usize },
    #[error("Skeleton from peer {peer} is not strictly ascending in height")]
    InvalidSkeleton { peer: PeerId },
    #[error("Block #{height} from peer {peer} is an orphan")]
    OrphanBlock { height: u64, peer: PeerId },
    #[error("Block #{height} from peer {peer} was rejected: {source}")]
    BlockRejected {
        height: u64,
        peer: PeerId,
        source: ChainError,
    },
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Storage error: {0}")]
    Storage(#[from] SyncStorageError),
}

#[derive(Debug, Error)]
pub enum BlockKeeperError {
    #[error("Fast sync failed: {0}")]
    FastSync(#[from] FastSyncError),
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Block #{height} from peer {peer} was rejected: {source}")]
    BlockRejected {
        height: u64,
        peer: PeerId,
        source: ChainError,
    },
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}
