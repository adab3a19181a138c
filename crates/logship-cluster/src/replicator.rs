//! Pull-based follower replication.
//!
//! Used when consensus is not the replication vehicle, e.g. a non-voting
//! peer that should mirror another node's log. One pump per peer: dial the
//! peer over the record protocol, open a `ReadStream` from offset 0, and
//! append every received record to the local server. A stream error logs
//! and ends the pump; whatever layer tracks membership re-joins the peer
//! to restart it.

use crate::stream_layer::{PeerDialer, RPC_LOG};
use bytes::Bytes;
use logship_core::LogWriter;
use logship_proto::v1::log_client::LogClient;
use logship_proto::v1::ReadRequest;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error};

pub struct Replicator {
    dialer: PeerDialer,
    local: Arc<dyn LogWriter>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Peer name to its pump's cancel handle.
    peers: HashMap<String, oneshot::Sender<()>>,
    closed: bool,
}

impl Replicator {
    /// A replicator appending into `local`, dialing peers with `dialer`.
    pub fn new(local: Arc<dyn LogWriter>, dialer: PeerDialer) -> Self {
        Self {
            dialer,
            local,
            inner: Mutex::new(Inner {
                peers: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Start replicating from the peer. A no-op when the peer is already
    /// tracked or the replicator is closed.
    pub fn join(&self, name: &str, addr: &str) {
        let mut inner = self.inner.lock();
        if inner.closed || inner.peers.contains_key(name) {
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        inner.peers.insert(name.to_string(), cancel_tx);

        tokio::spawn(replicate(
            self.dialer.clone(),
            Arc::clone(&self.local),
            name.to_string(),
            addr.to_string(),
            cancel_rx,
        ));
    }

    /// Stop replicating from the peer.
    pub fn leave(&self, name: &str) {
        let mut inner = self.inner.lock();
        // Dropping the cancel handle wakes the pump.
        inner.peers.remove(name);
    }

    /// Cancel every pump; later joins become no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.peers.clear();
    }
}

async fn replicate(
    dialer: PeerDialer,
    local: Arc<dyn LogWriter>,
    name: String,
    addr: String,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let pump = async {
        let channel = dialer.dial(&addr, RPC_LOG).await?;
        let mut client = LogClient::new(channel);

        let mut stream = client
            .read_stream(ReadRequest { offset: 0 })
            .await
            .map_err(|e| logship_core::Error::Transport(e.to_string()))?
            .into_inner();

        while let Some(response) = stream
            .message()
            .await
            .map_err(|e| logship_core::Error::Transport(e.to_string()))?
        {
            if let Some(record) = response.record {
                local.append(Bytes::from(record.value)).await?;
            }
        }
        Ok::<(), logship_core::Error>(())
    };

    tokio::select! {
        _ = &mut cancel_rx => {
            debug!(peer = %name, "replication cancelled");
        }
        result = pump => {
            match result {
                Ok(()) => debug!(peer = %name, "replication stream ended"),
                Err(e) => error!(peer = %name, %addr, %e, "replication failed"),
            }
        }
    }
}
