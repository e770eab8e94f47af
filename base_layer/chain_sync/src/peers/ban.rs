// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{sync::Arc, time::Duration};

use log::*;

use crate::{
    config::ChainSyncConfig,
    peers::{BanLevel, PeerId, PeerNetwork},
};

const LOG_TARGET: &str = "c::cs::peers::ban";

// Sync peers are banned for every reported offence unless they are on the allow list for sync.

pub struct PeerBanManager {
    forced_sync_peers: Vec<PeerId>,
    ban_period: Duration,
    short_ban_period: Duration,
    network: Arc<dyn PeerNetwork>,
}

impl PeerBanManager {
    pub fn new(config: &ChainSyncConfig, network: Arc<dyn PeerNetwork>) -> Self {
        Self {
            forced_sync_peers: config.forced_sync_peers.clone(),
            ban_period: config.ban_period,
            short_ban_period: config.short_ban_period,
            network,
        }
    }

    pub fn ban_duration(&self, level: BanLevel) -> Duration {
        match level {
            BanLevel::MsgIllegal => self.ban_period,
            BanLevel::ConnException => self.short_ban_period,
        }
    }

    /// Bans the peer unless it is allow-listed. Returns true if the peer should be disconnected from sync.
    pub async fn ban_peer_if_required(&self, peer_id: &PeerId, level: BanLevel, ban_reason: &str) -> bool {
        if self.forced_sync_peers.contains(peer_id) {
            debug!(
                target: LOG_TARGET,
                "Not banning peer that is on the allow list for sync. Ban reason = {}", ban_reason
            );
            return false;
        }
        debug!(
            target: LOG_TARGET,
            "Sync peer {} removed from the sync peer list because {} ({})", peer_id, ban_reason, level
        );

        let ban_duration = self.ban_duration(level);
        match self
            .network
            .ban_peer_until(peer_id, ban_duration, ban_reason.to_string())
            .await
        {
            Ok(_) => {
                warn!(target: LOG_TARGET, "Banned sync peer {} for {:?} because {}", peer_id, ban_duration, ban_reason)
            },
            Err(err) => error!(target: LOG_TARGET, "Failed to ban sync peer {}: {}", peer_id, err),
        }
        true
    }
}
