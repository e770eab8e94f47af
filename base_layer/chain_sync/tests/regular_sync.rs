// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

use tari_chain_sync::{
    config::ChainSyncConfig,
    peers::ServiceFlags,
    sync::BlockKeeperError,
    test_helpers::{create_chain, RemoteBehaviour},
};

mod helpers;
use helpers::nodes::{remote_chain, test_config, TestNode};

async fn setup(config: ChainSyncConfig, behaviour: RemoteBehaviour) -> TestNode {
    let node = TestNode::new(config, create_chain(11));
    let remote = remote_chain(20);
    node.connect("a", &remote, ServiceFlags::FULL_NODE, behaviour).await;
    node
}

#[tokio::test]
async fn it_syncs_block_by_block_up_to_the_peer_height() {
    let node = setup(test_config(), RemoteBehaviour::default()).await;
    let a = "a".into();

    assert!(node.manager.block_keeper().start_sync().await);
    assert_eq!(node.chain.height(), 19);
    assert_eq!(node.network.block_requests(&a), (11..=19).collect::<Vec<_>>());
    assert!(node.manager.is_caught_up().await.unwrap());
    assert!(!node.manager.block_keeper().start_sync().await);
}

#[tokio::test]
async fn it_limits_the_blocks_requested_per_cycle() {
    let config = ChainSyncConfig {
        max_num_of_blocks_regular_sync: 4,
        ..test_config()
    };
    let node = setup(config, RemoteBehaviour::default()).await;

    assert!(node.manager.block_keeper().start_sync().await);
    assert_eq!(node.chain.height(), 14);
    assert_eq!(node.network.block_requests(&"a".into()), vec![11, 12, 13, 14]);
}

#[tokio::test]
async fn it_retries_an_orphan_at_the_same_height() {
    let node = setup(test_config(), RemoteBehaviour::default()).await;
    node.chain.set_orphan_once(11);

    assert!(node.manager.block_keeper().start_sync().await);
    let mut expected = vec![11];
    expected.extend(11..=19);
    assert_eq!(node.network.block_requests(&"a".into()), expected);
    assert_eq!(node.chain.height(), 19);
    assert!(node.network.bans().is_empty());
}

#[tokio::test]
async fn it_gives_up_on_a_persistent_orphan() {
    let node = setup(test_config(), RemoteBehaviour::default()).await;
    node.chain.set_always_orphan(11);

    assert!(!node.manager.block_keeper().start_sync().await);
    // The first request plus max_regular_sync_orphan_retries retries
    assert_eq!(node.network.block_requests(&"a".into()), vec![11, 11, 11, 11]);
    assert_eq!(node.chain.height(), 10);
    assert!(node.network.bans().is_empty());
}

#[tokio::test]
async fn it_ends_the_cycle_when_a_block_does_not_advance_the_chain() {
    let node = setup(test_config(), RemoteBehaviour::default()).await;
    node.chain.set_dust(11);

    assert!(!node.manager.block_keeper().start_sync().await);
    assert_eq!(node.network.block_requests(&"a".into()), vec![11]);
    assert_eq!(node.chain.height(), 10);
}

#[tokio::test]
async fn it_tolerates_the_configured_number_of_stalls() {
    let config = ChainSyncConfig {
        max_regular_sync_stalls: 3,
        ..test_config()
    };
    let node = setup(config, RemoteBehaviour::default()).await;
    node.chain.set_dust(11);

    assert!(!node.manager.block_keeper().start_sync().await);
    assert_eq!(node.network.block_requests(&"a".into()), vec![11, 11, 11]);
}

#[tokio::test]
async fn it_bans_a_peer_that_sends_an_invalid_block() {
    let node = setup(test_config(), RemoteBehaviour::default()).await;
    node.chain.set_reject(13);
    let a = "a".into();

    let peer = node.peer(&a);
    let err = node
        .manager
        .block_keeper()
        .regular_block_sync(&peer)
        .await
        .unwrap_err();
    assert!(matches!(err, BlockKeeperError::BlockRejected { height: 13, .. }));
    assert_eq!(node.network.block_requests(&a), vec![11, 12, 13]);
    assert_eq!(node.chain.height(), 12);
    assert_eq!(node.network.bans(), vec![(a.clone(), Duration::from_secs(30 * 60))]);
    assert!(!node.manager.peers().contains(&a));
}

#[tokio::test(start_paused = true)]
async fn it_briefly_bans_a_peer_that_does_not_answer() {
    let node = setup(test_config(), RemoteBehaviour {
        silent: true,
        ..Default::default()
    })
    .await;
    let a = "a".into();

    let peer = node.peer(&a);
    let err = node
        .manager
        .block_keeper()
        .regular_block_sync(&peer)
        .await
        .unwrap_err();
    assert!(matches!(err, BlockKeeperError::Fetch(_)));
    assert_eq!(node.network.block_requests(&a), vec![11]);
    assert_eq!(node.chain.height(), 10);
    assert_eq!(node.network.bans(), vec![(a.clone(), Duration::from_secs(60))]);
    assert!(!node.manager.peers().contains(&a));
}
