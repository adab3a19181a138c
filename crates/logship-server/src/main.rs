//! logship-server: run one logship node.
//!
//! Starts an agent from flags and serves until interrupted. Exactly one
//! node of a fresh cluster is started with `--bootstrap`; further nodes
//! are added by whatever membership integration drives
//! `DistributedLog::join` on the leader.

use anyhow::Context;
use clap::Parser;
use logship_server::{tls, Agent, AgentConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "logship-server", about = "Distributed commit log node")]
struct Args {
    /// Unique node id.
    #[arg(long)]
    id: u64,

    /// Listen address for the multiplexed RPC socket.
    #[arg(long, default_value = "127.0.0.1:8400")]
    bind_addr: String,

    /// Data directory for the commit log and raft state.
    #[arg(long)]
    data_dir: PathBuf,

    /// Bootstrap a fresh single-node cluster.
    #[arg(long)]
    bootstrap: bool,

    /// JSON ACL policy file; omit to allow everyone.
    #[arg(long)]
    acl_policy_file: Option<PathBuf>,

    /// Server certificate (PEM). Enables TLS on the listener.
    #[arg(long, requires = "server_key_file")]
    server_cert_file: Option<PathBuf>,

    /// Server private key (PEM).
    #[arg(long, requires = "server_cert_file")]
    server_key_file: Option<PathBuf>,

    /// CA bundle clients and peers must chain to. With a server
    /// certificate configured this also turns on mutual TLS.
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Client certificate presented on peer dials (PEM).
    #[arg(long, requires = "peer_key_file")]
    peer_cert_file: Option<PathBuf>,

    /// Client private key for peer dials (PEM).
    #[arg(long, requires = "peer_cert_file")]
    peer_key_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let server_tls = match (&args.server_cert_file, &args.server_key_file) {
        (Some(cert), Some(key)) => Some(
            tls::load_server_config(cert, key, args.ca_file.as_deref())
                .context("loading server TLS")?,
        ),
        _ => None,
    };

    let peer_tls = match &args.ca_file {
        Some(ca) => {
            let identity = match (&args.peer_cert_file, &args.peer_key_file) {
                (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
                _ => None,
            };
            Some(tls::load_client_config(ca, identity).context("loading peer TLS")?)
        }
        None => None,
    };

    let mut agent = Agent::new(AgentConfig {
        id: args.id,
        bind_addr: args.bind_addr,
        data_dir: args.data_dir,
        bootstrap: args.bootstrap,
        acl_policy_file: args.acl_policy_file,
        server_tls,
        peer_tls,
        ..AgentConfig::default()
    })
    .await
    .context("starting agent")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    agent.shutdown().await.context("shutting down")?;
    Ok(())
}
