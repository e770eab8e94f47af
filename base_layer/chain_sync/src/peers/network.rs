// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{messages::ChainMessage, peers::PeerId};

#[derive(Debug, Clone, Error)]
pub enum PeerNetworkError {
    #[error("Peer {0} is not connected")]
    PeerNotConnected(PeerId),
    #[error("Failed to send message to peer {peer}: {details}")]
    SendFailed { peer: PeerId, details: String },
    #[error("Failed to ban peer {peer}: {details}")]
    BanFailed { peer: PeerId, details: String },
}

/// The transport used to reach connected peers
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    async fn send_message(&self, peer_id: &PeerId, msg: ChainMessage) -> Result<(), PeerNetworkError>;

    async fn ban_peer_until(&self, peer_id: &PeerId, duration: Duration, reason: String)
        -> Result<(), PeerNetworkError>;
}
