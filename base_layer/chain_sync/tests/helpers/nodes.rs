// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{sync::Arc, time::Duration};

use tari_chain_sync::{
    config::ChainSyncConfig,
    messages::ChainMessage,
    peers::{Peer, PeerId, ServiceFlags},
    test_helpers::{create_chain, MockChain, MockNetwork, RemoteBehaviour},
    Manager,
};
use tari_sync_types::Block;
use tempfile::{tempdir, TempDir};
use tokio::task::JoinHandle;

/// Small skeleton gaps so that a chain of a few hundred blocks needs several fast sync sessions
pub fn test_config() -> ChainSyncConfig {
    ChainSyncConfig {
        sync_cycle: Duration::from_secs(1),
        num_of_blocks_skeleton_gap: 8,
        min_size_of_sync_skeleton: 2,
        max_size_of_sync_skeleton: 5,
        fast_sync_pivot_gap: 4,
        min_gap_start_fast_sync: 16,
        check_sync_peer_num_interval: Duration::from_secs(1),
        // A handful of blocks fit in memory, the rest spill to LMDB
        max_byte_of_storage_ram: 1024,
        ..Default::default()
    }
}

pub struct TestNode {
    pub manager: Arc<Manager>,
    pub chain: Arc<MockChain>,
    pub network: Arc<MockNetwork>,
    inbound_task: JoinHandle<()>,
    _data_dir: TempDir,
}

impl TestNode {
    /// A node whose local chain holds `blocks`. Replies from remote peers are fed back into the manager.
    pub fn new(mut config: ChainSyncConfig, blocks: Vec<Arc<Block>>) -> Self {
        let data_dir = tempdir().unwrap();
        config.fast_sync_db_path = data_dir.path().join("fast_sync");
        config.fast_sync_db_map_size_mb = 16;

        let (network, mut inbound) = MockNetwork::with_inbound();
        let network = Arc::new(network);
        let chain = Arc::new(MockChain::new(blocks));
        let manager = Manager::new(config, chain.clone(), network.clone()).unwrap();

        let inbound_task = tokio::spawn({
            let manager = manager.clone();
            async move {
                while let Some((peer_id, msg)) = inbound.recv().await {
                    manager.handle_message(&peer_id, msg).await;
                }
            }
        });

        Self {
            manager,
            chain,
            network,
            inbound_task,
            _data_dir: data_dir,
        }
    }

    /// Connects a simulated remote peer that serves `remote` and announces its status
    pub async fn connect(
        &self,
        peer_id: &str,
        remote: &Arc<MockChain>,
        services: ServiceFlags,
        behaviour: RemoteBehaviour,
    ) -> PeerId {
        let peer_id = PeerId::from(peer_id);
        self.network.add_remote(peer_id.clone(), remote.clone(), behaviour);
        self.manager.add_peer(peer_id.clone(), services).await.unwrap();
        self.manager
            .handle_message(&peer_id, ChainMessage::Status(remote.status().unwrap()))
            .await;
        peer_id
    }

    pub fn peer(&self, peer_id: &PeerId) -> Peer {
        self.manager.peers().get_peer(peer_id).unwrap()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.inbound_task.abort();
    }
}

pub fn fast_sync_services() -> ServiceFlags {
    ServiceFlags::FULL_NODE | ServiceFlags::FAST_SYNC
}

/// A remote chain of `num_blocks` blocks that shares its prefix with every other chain made by `create_chain`
pub fn remote_chain(num_blocks: u64) -> Arc<MockChain> {
    Arc::new(MockChain::new(create_chain(num_blocks)))
}

/// Asserts that `heights` counts up by one from `start` to `end`
pub fn assert_consecutive(heights: &[u64], start: u64, end: u64) {
    let expected = (start..=end).collect::<Vec<_>>();
    assert_eq!(heights, expected.as_slice());
}
