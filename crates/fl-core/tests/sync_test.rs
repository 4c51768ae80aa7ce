//! Network sync between in-process nodes

mod common;

use common::{link_all, spawn_node, PASSWORD};
use fl_core::sync::{respond_sync_get, SyncGetRequest};
use fl_core::{MemoryHub, Registry};

const NETWORK: &str = "hive";

#[tokio::test]
async fn test_three_nodes_converge() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "alpha", false, None).await;
    let b = spawn_node(&hub, "bravo", false, None).await;
    let c = spawn_node(&hub, "charlie", false, None).await;
    link_all(&hub, &[&a, &b, &c]);

    for node in [&a, &b, &c] {
        node.federation.create_network(NETWORK, PASSWORD).await.unwrap();
    }

    // a and b only know c
    a.register(&c, Some(NETWORK)).await;
    b.register(&c, Some(NETWORK)).await;

    let report = a
        .federation
        .supervisor()
        .run_pass_now(NETWORK, a.syncer.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.pushed, 1);

    let report = b
        .federation
        .supervisor()
        .run_pass_now(NETWORK, b.syncer.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.learned, 1);

    let report = c
        .federation
        .supervisor()
        .run_pass_now(NETWORK, c.syncer.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 0);

    let mut expected = vec![a.peer.to_string(), b.peer.to_string(), c.peer.to_string()];
    expected.sort();
    assert_eq!(a.member_peers(NETWORK).await, expected);
    assert_eq!(b.member_peers(NETWORK).await, expected);
    assert_eq!(c.member_peers(NETWORK).await, expected);

    // learned nodes are let through the gate
    assert!(a.gate.check(&b.peer));
    assert!(b.gate.check(&a.peer));
}

#[tokio::test]
async fn test_busy_member_is_deferred() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "alpha", false, None).await;
    let c = spawn_node(&hub, "charlie", false, None).await;
    link_all(&hub, &[&a, &c]);

    a.federation.create_network(NETWORK, PASSWORD).await.unwrap();
    c.federation.create_network(NETWORK, PASSWORD).await.unwrap();
    a.register(&c, Some(NETWORK)).await;

    let guard = c.federation.supervisor().try_begin_pass(NETWORK).unwrap();
    let report = a.syncer.sync_network(NETWORK).await.unwrap();
    assert_eq!(report.busy, 1);
    assert_eq!(report.synced, 0);
    assert!(!c.member_peers(NETWORK).await.contains(&a.peer.to_string()));

    // deferred members stay stale and are retried on the next pass
    drop(guard);
    let report = a.syncer.sync_network(NETWORK).await.unwrap();
    assert_eq!(report.synced, 1);
    assert!(c.member_peers(NETWORK).await.contains(&a.peer.to_string()));
}

#[tokio::test]
async fn test_pass_is_exclusive_per_network() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "alpha", false, None).await;
    a.federation.create_network(NETWORK, PASSWORD).await.unwrap();

    let _guard = a.federation.supervisor().try_begin_pass(NETWORK).unwrap();
    assert!(a
        .federation
        .supervisor()
        .run_pass_now(NETWORK, a.syncer.as_ref())
        .await
        .is_none());
}

#[tokio::test]
async fn test_wrong_password_fails_member() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "alpha", false, None).await;
    let c = spawn_node(&hub, "charlie", false, None).await;
    link_all(&hub, &[&a, &c]);

    a.federation.create_network(NETWORK, PASSWORD).await.unwrap();
    c.federation.create_network(NETWORK, "something else").await.unwrap();
    a.register(&c, Some(NETWORK)).await;

    let report = a.syncer.sync_network(NETWORK).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(c.member_peers(NETWORK).await, vec![c.peer.to_string()]);
}

#[tokio::test]
async fn test_sync_get_with_empty_knowledge() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, "alpha", false, None).await;
    let b = spawn_node(&hub, "bravo", false, None).await;
    let c = spawn_node(&hub, "charlie", false, None).await;

    c.federation.create_network(NETWORK, PASSWORD).await.unwrap();
    c.register(&b, Some(NETWORK)).await;

    let own = a.federation.ensure_own_node().await.unwrap();
    let resp = respond_sync_get(
        &c.federation,
        NETWORK,
        SyncGetRequest {
            peer_ids: Vec::new(),
            requestor_info: own.sync_info(),
            peer_info_hashes: Default::default(),
        },
    )
    .await
    .unwrap();

    let mut missing: Vec<String> = resp.missing_nodes.iter().map(|n| n.peer_id.clone()).collect();
    missing.sort();
    let mut expected = vec![b.peer.to_string(), c.peer.to_string()];
    expected.sort();
    assert_eq!(missing, expected);
    assert!(resp.different_nodes.is_empty());

    // the requestor is now a member
    let network = c.registry.network_by_name(NETWORK).await.unwrap().unwrap();
    let members = c.registry.network_members(network.id).await.unwrap();
    assert!(members.iter().any(|m| m.node.peer_id == a.peer.to_string()));
}
