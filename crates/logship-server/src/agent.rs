//! The agent assembles one runnable node.
//!
//! One TCP listener feeds the stream layer, which splits connections into
//! consensus and record traffic; each half is served by its own gRPC
//! server. The distributed log underneath owns storage and consensus.
//! Shutdown tears things down in order: accept loop, gRPC servers, raft,
//! commit log.

use crate::acl::{Acl, Authorize};
use crate::service::LogService;
use logship_cluster::network::RaftTransportService;
use logship_cluster::{DistributedLog, NodeId, RaftNodeConfig, StreamLayer};
use logship_core::{Error, Record, Result};
use logship_proto::raft::raft_transport_server::RaftTransportServer;
use logship_proto::v1::log_server::LogServer;
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

/// Configuration for one node.
#[derive(Clone)]
pub struct AgentConfig {
    /// Unique node id.
    pub id: NodeId,

    /// Listen address for the multiplexed RPC socket. Use port 0 to let
    /// the OS pick.
    pub bind_addr: String,

    /// Directory holding the commit log and raft state.
    pub data_dir: PathBuf,

    /// Whether this node bootstraps a fresh cluster.
    pub bootstrap: bool,

    /// JSON ACL policy path; absent means allow everyone.
    pub acl_policy_file: Option<PathBuf>,

    /// TLS served to clients and peers dialing this node.
    pub server_tls: Option<Arc<rustls::ServerConfig>>,

    /// TLS used when dialing peers.
    pub peer_tls: Option<Arc<rustls::ClientConfig>>,

    /// Consensus and storage tunables. `id`, `advertise_addr` and
    /// `bootstrap` are filled in by the agent.
    pub raft: RaftNodeConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: 1,
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: PathBuf::from("./logship-data"),
            bootstrap: false,
            acl_policy_file: None,
            server_tls: None,
            peer_tls: None,
            raft: RaftNodeConfig::default(),
        }
    }
}

/// A running node.
pub struct Agent {
    log: Arc<DistributedLog>,
    rpc_addr: SocketAddr,
    shutdowns: Vec<oneshot::Sender<()>>,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let rpc_addr = listener.local_addr()?;

        let layer = StreamLayer::new(listener, config.server_tls.clone(), config.peer_tls.clone());
        let dialer = layer.peer_dialer();
        let (raft_incoming, log_incoming, mux_shutdown) = layer.split();

        let raft_config = RaftNodeConfig {
            id: config.id,
            advertise_addr: rpc_addr.to_string(),
            bootstrap: config.bootstrap,
            ..config.raft.clone()
        };
        let log = Arc::new(DistributedLog::open(&config.data_dir, raft_config, dialer).await?);

        let authorizer: Arc<dyn Authorize> = match &config.acl_policy_file {
            Some(path) => {
                Arc::new(Acl::from_file(path).map_err(|e| Error::Config(e.to_string()))?)
            }
            None => Arc::new(Acl::allow_all()),
        };

        let (raft_shutdown, raft_shutdown_rx) = oneshot::channel();
        let raft_service = RaftTransportService::new(log.raft());
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(RaftTransportServer::new(raft_service))
                .serve_with_incoming_shutdown(raft_incoming, async {
                    let _ = raft_shutdown_rx.await;
                })
                .await;
        });

        let (log_shutdown, log_shutdown_rx) = oneshot::channel();
        let service = LogService::new(log.clone(), log.clone(), authorizer);
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(LogServer::new(service))
                .serve_with_incoming_shutdown(log_incoming, async {
                    let _ = log_shutdown_rx.await;
                })
                .await;
        });

        info!(id = config.id, addr = %rpc_addr, "agent started");

        Ok(Self {
            log,
            rpc_addr,
            shutdowns: vec![mux_shutdown, raft_shutdown, log_shutdown],
        })
    }

    /// Address of the multiplexed RPC socket.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// The node's distributed log.
    pub fn log(&self) -> Arc<DistributedLog> {
        Arc::clone(&self.log)
    }

    /// Add a member to the cluster. Leader only.
    pub async fn join(&self, id: NodeId, addr: &str) -> Result<()> {
        self.log.join(id, addr).await
    }

    /// Remove a member from the cluster. Leader only.
    pub async fn leave(&self, id: NodeId) -> Result<()> {
        self.log.leave(id).await
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        self.log.wait_for_leader(timeout).await
    }

    /// Read from the locally applied log.
    pub fn read(&self, offset: u64) -> Result<Record> {
        self.log.read(offset)
    }

    /// Append through consensus. Leader only.
    pub async fn append(&self, value: Bytes) -> Result<u64> {
        self.log.append(value).await
    }

    /// Stop serving, then shut down consensus and close the log.
    pub async fn shutdown(&mut self) -> Result<()> {
        for tx in self.shutdowns.drain(..) {
            let _ = tx.send(());
        }
        self.log.close().await
    }
}
