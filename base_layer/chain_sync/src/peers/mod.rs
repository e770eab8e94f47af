// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::fmt::{Display, Formatter};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tari_sync_types::BlockHash;

mod ban;
pub use ban::PeerBanManager;

mod network;
pub use network::{PeerNetwork, PeerNetworkError};

mod peer_set;
pub use peer_set::PeerSet;

use crate::messages::ChainStatus;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

bitflags! {
    /// Services a peer advertises when it connects
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
    pub struct ServiceFlags: u8 {
        /// Peer stores and serves the full chain
        const FULL_NODE = 0b0000_0001;
        /// Peer serves header skeletons and block ranges for fast sync
        const FAST_SYNC = 0b0000_0010;
    }
}

/// Severity of peer misbehaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanLevel {
    /// The peer sent data that violates the protocol
    MsgIllegal,
    /// The peer timed out or a request to it could not be delivered
    ConnException,
}

impl Display for BanLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BanLevel::MsgIllegal => f.write_str("illegal message"),
            BanLevel::ConnException => f.write_str("connection exception"),
        }
    }
}

/// A snapshot of a connected peer and the chain status it last advertised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    id: PeerId,
    services: ServiceFlags,
    best_height: u64,
    best_hash: BlockHash,
    justified_height: u64,
    justified_hash: BlockHash,
}

impl Peer {
    pub fn new(id: PeerId, services: ServiceFlags) -> Self {
        Self {
            id,
            services,
            best_height: 0,
            best_hash: BlockHash::zero(),
            justified_height: 0,
            justified_hash: BlockHash::zero(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn services(&self) -> ServiceFlags {
        self.services
    }

    pub fn supports(&self, flags: ServiceFlags) -> bool {
        self.services.contains(flags)
    }

    pub fn height(&self) -> u64 {
        self.best_height
    }

    pub fn best_hash(&self) -> &BlockHash {
        &self.best_hash
    }

    pub fn justified_height(&self) -> u64 {
        self.justified_height
    }

    pub fn justified_hash(&self) -> &BlockHash {
        &self.justified_hash
    }

    pub(crate) fn set_status(&mut self, status: &ChainStatus) {
        self.best_height = status.best_height;
        self.best_hash = status.best_hash;
        self.justified_height = status.justified_height;
        self.justified_hash = status.justified_hash;
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (best: {}, justified: {})",
            self.id, self.best_height, self.justified_height
        )
    }
}
