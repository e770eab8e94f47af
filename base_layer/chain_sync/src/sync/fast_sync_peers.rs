// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{collections::HashMap, sync::Mutex};

use rand::{rngs::OsRng, seq::SliceRandom};

use crate::peers::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Idle,
    Busy,
}

/// The peers taking part in a single fast sync session. A peer is busy while it has a block range request in flight.
#[derive(Default)]
pub struct FastSyncPeerPool {
    peers: Mutex<HashMap<PeerId, PeerState>>,
}

impl FastSyncPeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an idle peer. Adding a peer that is already in the pool leaves its state unchanged.
    pub fn add(&self, peer_id: PeerId) {
        acquire_lock!(self.peers).entry(peer_id).or_insert(PeerState::Idle);
    }

    pub fn delete(&self, peer_id: &PeerId) -> bool {
        acquire_lock!(self.peers).remove(peer_id).is_some()
    }

    /// Marks every idle peer busy and returns them in random order
    pub fn select_idle_peers(&self) -> Vec<PeerId> {
        let mut peers = acquire_lock!(self.peers);
        let mut idle = peers
            .iter_mut()
            .filter(|(_, state)| **state == PeerState::Idle)
            .map(|(id, state)| {
                *state = PeerState::Busy;
                id.clone()
            })
            .collect::<Vec<_>>();
        idle.shuffle(&mut OsRng);
        idle
    }

    /// Marks a random idle peer busy and returns it
    pub fn select_idle_peer(&self) -> Option<PeerId> {
        let mut peers = acquire_lock!(self.peers);
        let idle = peers
            .iter()
            .filter(|(_, state)| **state == PeerState::Idle)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        let selected = idle.choose(&mut OsRng)?.clone();
        peers.insert(selected.clone(), PeerState::Busy);
        Some(selected)
    }

    /// Returns a peer to the idle set. Peers no longer in the pool are ignored.
    pub fn set_idle(&self, peer_id: &PeerId) {
        if let Some(state) = acquire_lock!(self.peers).get_mut(peer_id) {
            *state = PeerState::Idle;
        }
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        acquire_lock!(self.peers).contains_key(peer_id)
    }

    pub fn size(&self) -> usize {
        acquire_lock!(self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        acquire_lock!(self.peers).clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn it_hands_out_each_idle_peer_once() {
        let pool = FastSyncPeerPool::new();
        pool.add("a".into());
        pool.add("b".into());
        pool.add("c".into());

        let mut selected = pool.select_idle_peers();
        selected.sort();
        assert_eq!(selected, vec![PeerId::from("a"), PeerId::from("b"), PeerId::from("c")]);
        assert!(pool.select_idle_peers().is_empty());
        assert!(pool.select_idle_peer().is_none());

        pool.set_idle(&"b".into());
        assert_eq!(pool.select_idle_peer(), Some("b".into()));
        assert!(pool.select_idle_peer().is_none());
    }

    #[test]
    fn add_does_not_reset_busy_peers() {
        let pool = FastSyncPeerPool::new();
        pool.add("a".into());
        assert_eq!(pool.select_idle_peer(), Some("a".into()));
        pool.add("a".into());
        assert!(pool.select_idle_peer().is_none());
    }

    #[test]
    fn deleted_peers_are_not_revived() {
        let pool = FastSyncPeerPool::new();
        pool.add("a".into());
        assert!(pool.delete(&"a".into()));
        assert!(!pool.delete(&"a".into()));
        pool.set_idle(&"a".into());
        assert!(pool.is_empty());
        assert!(pool.select_idle_peer().is_none());
    }

    #[test]
    fn clear_is_idempotent() {
        let pool = FastSyncPeerPool::new();
        pool.add("a".into());
        pool.clear();
        assert_eq!(pool.size(), 0);
        pool.clear();
        assert_eq!(pool.size(), 0);
    }
}
