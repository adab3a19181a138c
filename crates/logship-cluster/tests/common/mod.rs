//! Shared harness for multi-node cluster tests.

use logship_cluster::network::RaftTransportService;
use logship_cluster::{DistributedLog, RaftNodeConfig, StreamLayer};
use logship_proto::raft::raft_transport_server::RaftTransportServer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub struct TestCluster {
    _dirs: Vec<TempDir>,
    pub nodes: Vec<TestNode>,
}

pub struct TestNode {
    pub log: Arc<DistributedLog>,
    pub addr: String,
    shutdowns: Vec<oneshot::Sender<()>>,
}

impl TestCluster {
    /// Start `count` plaintext nodes; the first bootstraps the cluster.
    pub async fn new(count: usize) -> Self {
        let mut dirs = Vec::with_capacity(count);
        let mut nodes = Vec::with_capacity(count);

        for i in 0..count {
            let dir = TempDir::new().expect("create temp dir");
            let node = TestNode::start(i as u64 + 1, i == 0, dir.path()).await;
            dirs.push(dir);
            nodes.push(node);
        }

        Self {
            _dirs: dirs,
            nodes,
        }
    }

    /// Join every non-bootstrap node through the leader.
    pub async fn join_all(&self) {
        for (i, node) in self.nodes.iter().enumerate().skip(1) {
            self.nodes[0]
                .log
                .join(i as u64 + 1, &node.addr)
                .await
                .expect("join node");
        }
    }

    pub async fn shutdown(&mut self) {
        for node in &mut self.nodes {
            let _ = node.log.close().await;
            for tx in node.shutdowns.drain(..) {
                let _ = tx.send(());
            }
        }
    }
}

impl TestNode {
    pub async fn start(id: u64, bootstrap: bool, dir: &std::path::Path) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();

        let layer = StreamLayer::new(listener, None, None);
        let dialer = layer.peer_dialer();
        let (raft_incoming, _log_incoming, mux_shutdown) = layer.split();

        let config = RaftNodeConfig {
            id,
            advertise_addr: addr.clone(),
            bootstrap,
            ..Default::default()
        };
        let log = Arc::new(
            DistributedLog::open(dir, config, dialer)
                .await
                .expect("open distributed log"),
        );

        let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel();
        let raft_service = RaftTransportService::new(log.raft());
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(RaftTransportServer::new(raft_service))
                .serve_with_incoming_shutdown(raft_incoming, async {
                    let _ = server_shutdown_rx.await;
                })
                .await;
        });

        Self {
            log,
            addr,
            shutdowns: vec![mux_shutdown, server_shutdown_tx],
        }
    }
}

/// Poll `check` until it passes or `timeout` elapses.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
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
