//! Replicator pump tests: two plain single-node servers, one pulling the
//! other's stream into its local log.

use logship_cluster::{Replicator, PeerDialer, StreamLayer};
use logship_core::{Config, LogWriter};
use logship_proto::v1::log_server::LogServer;
use logship_server::{Acl, LogService};
use logship_storage::CommitLog;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct TestNode {
    pub log: Arc<CommitLog>,
    pub addr: String,
    _dir: TempDir,
    shutdowns: Vec<oneshot::Sender<()>>,
}

/// One plaintext node serving the record protocol through the stream
/// layer, so prefix-dialed clients (the replicator included) can reach it.
async fn start_node() -> TestNode {
    let dir = TempDir::new().expect("temp dir");
    let log = Arc::new(CommitLog::open(dir.path(), Config::default()).expect("open log"));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let layer = StreamLayer::new(listener, None, None);
    let (_raft_incoming, log_incoming, mux_shutdown) = layer.split();

    let service = LogService::new(log.clone(), log.clone(), Arc::new(Acl::allow_all()));
    let (server_shutdown, server_shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(LogServer::new(service))
            .serve_with_incoming_shutdown(log_incoming, async {
                let _ = server_shutdown_rx.await;
            })
            .await;
    });

    TestNode {
        log,
        addr,
        _dir: dir,
        shutdowns: vec![mux_shutdown, server_shutdown],
    }
}

async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Records on the source node end up on the mirror in offset order,
/// without duplicates, including records appended after the join.
#[tokio::test]
async fn test_replicator_mirrors_peer() {
    let source = start_node().await;
    let mirror = start_node().await;

    for i in 0..3 {
        source.log.append(format!("record-{i}").as_bytes()).expect("append");
    }

    let replicator = Replicator::new(
        mirror.log.clone() as Arc<dyn LogWriter>,
        PeerDialer::plaintext(),
    );
    replicator.join("source", &source.addr);

    // Appends racing with the pump are picked up by the following stream.
    for i in 3..6 {
        source.log.append(format!("record-{i}").as_bytes()).expect("append");
    }

    let mirror_log = mirror.log.clone();
    assert!(
        eventually(Duration::from_secs(3), || {
            mirror_log.highest_offset() == 5 && mirror_log.read(0).is_ok()
        })
        .await,
        "mirror never caught up"
    );

    for i in 0..6u64 {
        let record = mirror.log.read(i).expect("mirror read");
        assert_eq!(record.offset, i);
        assert_eq!(record.value, format!("record-{i}").into_bytes());
    }

    replicator.close();
    drop(source.shutdowns);
    drop(mirror.shutdowns);
}

/// Leaving stops the pump: later source appends never reach the mirror.
#[tokio::test]
async fn test_leave_stops_pump() {
    let source = start_node().await;
    let mirror = start_node().await;

    source.log.append(b"before").expect("append");

    let replicator = Replicator::new(
        mirror.log.clone() as Arc<dyn LogWriter>,
        PeerDialer::plaintext(),
    );
    replicator.join("source", &source.addr);

    let mirror_log = mirror.log.clone();
    assert!(
        eventually(Duration::from_secs(3), || mirror_log.read(0).is_ok()).await,
        "mirror never received the first record"
    );

    replicator.leave("source");
    // Give the cancelled pump a moment to wind down.
    tokio::time::sleep(Duration::from_millis(100)).await;

    source.log.append(b"after").expect("append");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mirror.log.highest_offset(), 0);
    assert!(mirror.log.read(1).is_err());
}

/// Close cancels every pump and turns later joins into no-ops.
#[tokio::test]
async fn test_close_makes_join_a_noop() {
    let source = start_node().await;
    let mirror = start_node().await;

    source.log.append(b"record").expect("append");

    let replicator = Replicator::new(
        mirror.log.clone() as Arc<dyn LogWriter>,
        PeerDialer::plaintext(),
    );
    replicator.close();
    replicator.join("source", &source.addr);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(mirror.log.read(0).is_err(), "closed replicator must not pump");
}
