//! Multi-node replication tests.

mod common;

use bytes::Bytes;
use common::{eventually, TestCluster};
use logship_core::Error;
use std::time::Duration;

/// Records appended at the leader become readable at every node.
#[tokio::test]
async fn test_three_node_replication() {
    let mut cluster = TestCluster::new(3).await;
    cluster.nodes[0]
        .log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("leader elected");
    cluster.join_all().await;

    let first = cluster.nodes[0]
        .log
        .append(Bytes::from("first"))
        .await
        .expect("append first");
    let second = cluster.nodes[0]
        .log
        .append(Bytes::from("second"))
        .await
        .expect("append second");
    assert_eq!(first, 0);
    assert_eq!(second, 1);

    for (i, node) in cluster.nodes.iter().enumerate() {
        let log = &node.log;
        let converged = eventually(Duration::from_millis(500), || {
            log.read(0).map(|r| r.value.clone()).ok() == Some(Bytes::from("first"))
                && log.read(1).map(|r| r.value.clone()).ok() == Some(Bytes::from("second"))
        })
        .await;
        assert!(converged, "node {} did not converge", i + 1);
    }

    let servers = cluster.nodes[0].log.get_servers().await;
    assert_eq!(servers.len(), 3);
    let leader: Vec<_> = servers.iter().filter(|s| s.is_leader).collect();
    assert_eq!(leader.len(), 1);
    assert_eq!(leader[0].id, 1);

    cluster.shutdown().await;
}

/// A removed node stops receiving appends; the rest keep replicating.
#[tokio::test]
async fn test_leave_stops_replication() {
    let mut cluster = TestCluster::new(3).await;
    cluster.nodes[0]
        .log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("leader elected");
    cluster.join_all().await;

    cluster.nodes[0]
        .log
        .append(Bytes::from("first"))
        .await
        .expect("append first");

    cluster.nodes[0].log.leave(2).await.expect("leave node 2");
    let servers = cluster.nodes[0].log.get_servers().await;
    assert_eq!(servers.len(), 2);
    assert!(servers.iter().all(|s| s.id != 2));

    let offset = cluster.nodes[0]
        .log
        .append(Bytes::from("third"))
        .await
        .expect("append after leave");

    let remaining = &cluster.nodes[2].log;
    let converged = eventually(Duration::from_millis(500), || {
        remaining.read(offset).map(|r| r.value.clone()).ok() == Some(Bytes::from("third"))
    })
    .await;
    assert!(converged, "remaining follower did not converge");

    // The removed node never sees the new record.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        cluster.nodes[1].log.read(offset),
        Err(Error::OffsetOutOfRange { .. })
    ));

    cluster.shutdown().await;
}

/// Appends against a follower are rejected with a leader hint.
#[tokio::test]
async fn test_append_on_follower_fails_not_leader() {
    let mut cluster = TestCluster::new(2).await;
    cluster.nodes[0]
        .log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("leader elected");
    cluster.join_all().await;

    let err = cluster.nodes[1]
        .log
        .append(Bytes::from("nope"))
        .await
        .expect_err("follower must reject appends");
    assert!(matches!(
        err,
        Error::NotLeader {
            leader_hint: Some(1)
        }
    ));

    cluster.shutdown().await;
}

/// A restarted single-node cluster keeps its records and offsets.
#[tokio::test]
async fn test_single_node_restart_preserves_log() {
    let dir = tempfile::TempDir::new().expect("temp dir");

    {
        let node = common::TestNode::start(1, true, dir.path()).await;
        node.log
            .wait_for_leader(Duration::from_secs(3))
            .await
            .expect("leader elected");
        node.log
            .append(Bytes::from("durable"))
            .await
            .expect("append");
        let _ = node.log.close().await;
        drop(node);
    }

    let node = common::TestNode::start(1, true, dir.path()).await;
    node.log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("leader re-elected");

    assert_eq!(node.log.read(0).expect("read").value, Bytes::from("durable"));
    let offset = node.log.append(Bytes::from("more")).await.expect("append");
    assert_eq!(offset, 1);
}
