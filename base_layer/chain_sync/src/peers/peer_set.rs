// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use log::*;
use tari_sync_types::BlockHash;

use crate::{
    config::ChainSyncConfig,
    messages::{ChainMessage, ChainStatus, GetBlockBy},
    peers::{BanLevel, Peer, PeerBanManager, PeerId, PeerNetwork, PeerNetworkError, ServiceFlags},
};

const LOG_TARGET: &str = "c::cs::peers::peer_set";

/// The connected peers and the chain status each one last advertised. Locks are never held across network calls.
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, Peer>>,
    network: Arc<dyn PeerNetwork>,
    ban_manager: PeerBanManager,
}

impl PeerSet {
    pub fn new(config: &ChainSyncConfig, network: Arc<dyn PeerNetwork>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            ban_manager: PeerBanManager::new(config, network.clone()),
            network,
        }
    }

    /// Adds a newly connected peer. Returns false if the peer was already known.
    pub fn add_peer(&self, peer_id: PeerId, services: ServiceFlags) -> bool {
        let mut peers = acquire_write_lock!(self.peers);
        if peers.contains_key(&peer_id) {
            return false;
        }
        debug!(target: LOG_TARGET, "Peer {} connected with services {:?}", peer_id, services);
        peers.insert(peer_id.clone(), Peer::new(peer_id, services));
        true
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<Peer> {
        let removed = acquire_write_lock!(self.peers).remove(peer_id);
        if removed.is_some() {
            debug!(target: LOG_TARGET, "Peer {} removed from the peer set", peer_id);
        }
        removed
    }

    /// Records the chain status advertised by a peer. Returns false if the peer is unknown.
    pub fn set_status(&self, peer_id: &PeerId, status: &ChainStatus) -> bool {
        match acquire_write_lock!(self.peers).get_mut(peer_id) {
            Some(peer) => {
                peer.set_status(status);
                true
            },
            None => false,
        }
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<Peer> {
        acquire_read_lock!(self.peers).get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        acquire_read_lock!(self.peers).contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        acquire_read_lock!(self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        acquire_read_lock!(self.peers).keys().cloned().collect()
    }

    /// The peer with the highest best height among peers offering `services`
    pub fn best_peer(&self, services: ServiceFlags) -> Option<Peer> {
        acquire_read_lock!(self.peers)
            .values()
            .filter(|p| p.supports(services))
            .max_by(|a, b| a.height().cmp(&b.height()).then_with(|| b.id().cmp(a.id())))
            .cloned()
    }

    /// The peer with the highest justified height among peers offering `services`
    pub fn best_irreversible_peer(&self, services: ServiceFlags) -> Option<Peer> {
        acquire_read_lock!(self.peers)
            .values()
            .filter(|p| p.supports(services))
            .max_by(|a, b| {
                a.justified_height()
                    .cmp(&b.justified_height())
                    .then_with(|| b.id().cmp(a.id()))
            })
            .cloned()
    }

    /// All peers whose best height is at least `height`
    pub fn peers_by_height(&self, height: u64) -> Vec<Peer> {
        let mut peers = acquire_read_lock!(self.peers)
            .values()
            .filter(|p| p.height() >= height)
            .cloned()
            .collect::<Vec<_>>();
        peers.sort_by(|a, b| a.id().cmp(b.id()));
        peers
    }

    /// Reports misbehaviour by a peer. Peers that end up banned are removed from the set.
    pub async fn process_illegal(&self, peer_id: &PeerId, level: BanLevel, reason: &str) {
        warn!(target: LOG_TARGET, "Peer {} reported for {}: {}", peer_id, level, reason);
        if self.ban_manager.ban_peer_if_required(peer_id, level, reason).await {
            self.remove_peer(peer_id);
        }
    }

    pub async fn send_message(&self, peer_id: &PeerId, msg: ChainMessage) -> Result<(), PeerNetworkError> {
        if !self.contains(peer_id) {
            return Err(PeerNetworkError::PeerNotConnected(peer_id.clone()));
        }
        trace!(target: LOG_TARGET, "Sending {} to peer {}", msg, peer_id);
        self.network.send_message(peer_id, msg).await
    }

    pub async fn get_block(&self, peer_id: &PeerId, by: GetBlockBy) -> Result<(), PeerNetworkError> {
        self.send_message(peer_id, ChainMessage::GetBlock(by)).await
    }

    pub async fn get_headers(
        &self,
        peer_id: &PeerId,
        locator: Vec<BlockHash>,
        stop_hash: BlockHash,
        skip: u64,
    ) -> Result<(), PeerNetworkError> {
        self.send_message(peer_id, ChainMessage::GetHeaders {
            locator,
            stop_hash,
            skip,
        })
        .await
    }

    pub async fn get_blocks(
        &self,
        peer_id: &PeerId,
        locator: Vec<BlockHash>,
        stop_hash: BlockHash,
    ) -> Result<(), PeerNetworkError> {
        self.send_message(peer_id, ChainMessage::GetBlocks { locator, stop_hash })
            .await
    }

    /// Sends our chain status to every connected peer. Peers that cannot be reached are removed.
    pub async fn broadcast_status(&self, status: &ChainStatus) {
        for peer_id in self.peer_ids() {
            if let Err(err) = self
                .network
                .send_message(&peer_id, ChainMessage::Status(status.clone()))
                .await
            {
                warn!(target: LOG_TARGET, "Failed to broadcast status to peer {}: {}", peer_id, err);
                self.remove_peer(&peer_id);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test_helpers::MockNetwork;

    fn status(best_height: u64, justified_height: u64) -> ChainStatus {
        ChainStatus {
            best_height,
            best_hash: BlockHash::zero(),
            justified_height,
            justified_hash: BlockHash::zero(),
        }
    }

    fn peer_set(config: &ChainSyncConfig) -> (PeerSet, Arc<MockNetwork>) {
        let network = Arc::new(MockNetwork::new());
        (PeerSet::new(config, network.clone()), network)
    }

    #[test]
    fn it_selects_best_peers_by_capability() {
        let (peers, _) = peer_set(&ChainSyncConfig::default());
        assert!(peers.add_peer("a".into(), ServiceFlags::FULL_NODE | ServiceFlags::FAST_SYNC));
        assert!(peers.add_peer("b".into(), ServiceFlags::FULL_NODE));
        assert!(!peers.add_peer("b".into(), ServiceFlags::FULL_NODE));
        assert!(peers.set_status(&"a".into(), &status(100, 90)));
        assert!(peers.set_status(&"b".into(), &status(200, 10)));
        assert!(!peers.set_status(&"c".into(), &status(300, 300)));

        assert_eq!(peers.best_peer(ServiceFlags::FULL_NODE).unwrap().id().as_str(), "b");
        assert_eq!(peers.best_peer(ServiceFlags::FAST_SYNC).unwrap().id().as_str(), "a");
        assert_eq!(
            peers.best_irreversible_peer(ServiceFlags::FULL_NODE).unwrap().id().as_str(),
            "a"
        );
        let tall = peers.peers_by_height(150);
        assert_eq!(tall.len(), 1);
        assert_eq!(tall[0].id().as_str(), "b");
        assert_eq!(peers.peers_by_height(0).len(), 2);
    }

    #[tokio::test]
    async fn it_bans_and_removes_illegal_peers() {
        let (peers, network) = peer_set(&ChainSyncConfig::default());
        peers.add_peer("a".into(), ServiceFlags::FULL_NODE);
        peers.add_peer("b".into(), ServiceFlags::FULL_NODE);

        peers
            .process_illegal(&"a".into(), BanLevel::MsgIllegal, "bad block")
            .await;
        peers
            .process_illegal(&"b".into(), BanLevel::ConnException, "timeout")
            .await;

        assert!(peers.is_empty());
        let bans = network.bans();
        assert_eq!(bans.len(), 2);
        assert_eq!(bans[0], ("a".into(), Duration::from_secs(30 * 60)));
        assert_eq!(bans[1], ("b".into(), Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn it_never_bans_forced_sync_peers() {
        let config = ChainSyncConfig {
            forced_sync_peers: vec!["a".into()],
            ..Default::default()
        };
        let (peers, network) = peer_set(&config);
        peers.add_peer("a".into(), ServiceFlags::FULL_NODE);
        peers
            .process_illegal(&"a".into(), BanLevel::MsgIllegal, "bad block")
            .await;
        assert!(peers.contains(&"a".into()));
        assert!(network.bans().is_empty());
    }

    #[tokio::test]
    async fn it_refuses_to_send_to_unknown_peers() {
        let (peers, network) = peer_set(&ChainSyncConfig::default());
        let err = peers
            .get_block(&"x".into(), GetBlockBy::Height(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerNetworkError::PeerNotConnected(_)));
        assert!(network.sent().is_empty());
    }
}
