//! Multiplexed transport.
//!
//! One listening socket per node carries two protocols, told apart by the
//! first byte of every connection: `0x01` is consensus traffic, `0x02` is
//! the record RPC protocol (clients and the replicator). Anything else
//! closes the connection.
//!
//! When a server TLS config is present the handshake runs immediately
//! after the prefix byte; with mutual TLS the peer certificate's common
//! name rides along as the connection's subject, which the gRPC layer uses
//! for authorization. Outbound dials mirror this: prefix byte first, then
//! the peer TLS handshake. The two faces are configured independently.

use logship_core::{Error, Result};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::Connected;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, warn};

/// Protocol prefix for consensus connections.
pub const RPC_RAFT: u8 = 0x01;

/// Protocol prefix for record RPC connections.
pub const RPC_LOG: u8 = 0x02;

/// Demultiplexed inbound connections for one protocol.
pub type Incoming = ReceiverStream<std::io::Result<MuxStream>>;

/// The multiplexed listener.
pub struct StreamLayer {
    listener: TcpListener,
    server_tls: Option<Arc<rustls::ServerConfig>>,
    peer_tls: Option<Arc<rustls::ClientConfig>>,
}

impl StreamLayer {
    pub fn new(
        listener: TcpListener,
        server_tls: Option<Arc<rustls::ServerConfig>>,
        peer_tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            listener,
            server_tls,
            peer_tls,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Dialer for outbound connections that speaks this layer's peer TLS
    /// config.
    pub fn peer_dialer(&self) -> PeerDialer {
        PeerDialer {
            tls: self.peer_tls.clone(),
        }
    }

    /// Start accepting. Returns the consensus and record connection
    /// streams plus a shutdown handle; dropping or firing the handle stops
    /// the accept loop.
    pub fn split(self) -> (Incoming, Incoming, oneshot::Sender<()>) {
        let (raft_tx, raft_rx) = mpsc::channel(64);
        let (log_tx, log_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let acceptor = self.server_tls.map(TlsAcceptor::from);
        tokio::spawn(accept_loop(
            self.listener,
            acceptor,
            raft_tx,
            log_tx,
            shutdown_rx,
        ));

        (
            ReceiverStream::new(raft_rx),
            ReceiverStream::new(log_rx),
            shutdown_tx,
        )
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    raft_tx: mpsc::Sender<std::io::Result<MuxStream>>,
    log_tx: mpsc::Sender<std::io::Result<MuxStream>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("stream layer shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (socket, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(%e, "accept failed");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let raft_tx = raft_tx.clone();
                let log_tx = log_tx.clone();
                tokio::spawn(async move {
                    match handshake(socket, remote_addr, acceptor).await {
                        Ok((RPC_RAFT, stream)) => {
                            let _ = raft_tx.send(Ok(stream)).await;
                        }
                        Ok((RPC_LOG, stream)) => {
                            let _ = log_tx.send(Ok(stream)).await;
                        }
                        Ok((protocol, _)) => {
                            warn!(protocol, %remote_addr, "unroutable protocol prefix");
                        }
                        Err(e) => {
                            warn!(%e, %remote_addr, "connection handshake failed");
                        }
                    }
                });
            }
        }
    }
}

/// Read the protocol prefix and, when configured, run the TLS handshake.
/// An unknown prefix or a failed handshake drops the connection with no
/// data surfaced to either protocol.
async fn handshake(
    mut socket: TcpStream,
    remote_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) -> std::io::Result<(u8, MuxStream)> {
    let mut prefix = [0u8; 1];
    socket.read_exact(&mut prefix).await?;
    let protocol = prefix[0];
    if protocol != RPC_RAFT && protocol != RPC_LOG {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown protocol prefix {protocol:#04x}"),
        ));
    }

    let stream = match acceptor {
        None => MuxStream {
            io: MuxIo::Plain(socket),
            info: MuxConnectInfo {
                remote_addr: Some(remote_addr),
                peer_subject: None,
            },
        },
        Some(acceptor) => {
            let tls = acceptor.accept(socket).await?;
            let peer_subject = peer_common_name(&tls);
            MuxStream {
                io: MuxIo::Tls(Box::new(tls)),
                info: MuxConnectInfo {
                    remote_addr: Some(remote_addr),
                    peer_subject,
                },
            }
        }
    };
    Ok((protocol, stream))
}

/// Common name of the client certificate, when mutual TLS presented one.
fn peer_common_name(stream: &tokio_rustls::server::TlsStream<TcpStream>) -> Option<String> {
    let (_, connection) = stream.get_ref();
    let certs = connection.peer_certificates()?;
    let (_, cert) = x509_parser::parse_x509_certificate(certs.first()?.as_ref()).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}

/// Identity attached to every demultiplexed connection.
#[derive(Debug, Clone)]
pub struct MuxConnectInfo {
    pub remote_addr: Option<SocketAddr>,

    /// Mutual-TLS peer common name; `None` on plaintext connections or
    /// when the client presented no certificate.
    pub peer_subject: Option<String>,
}

/// An accepted connection with its protocol prefix consumed.
pub struct MuxStream {
    io: MuxIo,
    info: MuxConnectInfo,
}

enum MuxIo {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Connected for MuxStream {
    type ConnectInfo = MuxConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().io {
            MuxIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MuxIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().io {
            MuxIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MuxIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().io {
            MuxIo::Plain(s) => Pin::new(s).poll_flush(cx),
            MuxIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().io {
            MuxIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MuxIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dials peers through the stream layer: prefix byte first, then the peer
/// TLS handshake, then gRPC.
#[derive(Clone)]
pub struct PeerDialer {
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl PeerDialer {
    /// Dialer speaking the given client TLS config, or plaintext.
    pub fn new(tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self { tls }
    }

    /// Dialer with no peer TLS, for plaintext clusters and tests.
    pub fn plaintext() -> Self {
        Self { tls: None }
    }

    /// Open a gRPC channel to `addr` for the given protocol.
    pub async fn dial(&self, addr: &str, protocol: u8) -> Result<Channel> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| Error::Transport(e.to_string()))?;

        let tls = self.tls.clone();
        let target = addr.to_string();
        let channel = endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                let tls = tls.clone();
                let target = target.clone();
                async move {
                    let mut socket = TcpStream::connect(target.as_str()).await?;
                    socket.write_all(&[protocol]).await?;

                    let io = match tls {
                        None => DialStream::Plain(socket),
                        Some(config) => {
                            let host = target
                                .rsplit_once(':')
                                .map(|(host, _)| host)
                                .unwrap_or(target.as_str());
                            let server_name =
                                ServerName::try_from(host.to_string()).map_err(|e| {
                                    std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
                                })?;
                            let connector = TlsConnector::from(config);
                            DialStream::Tls(Box::new(connector.connect(server_name, socket).await?))
                        }
                    };
                    Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(io))
                }
            }))
            .await
            .map_err(|e| Error::Transport(format!("dial {addr}: {e}")))?;
        Ok(channel)
    }
}

/// An outbound connection with its protocol prefix already written.
enum DialStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for DialStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DialStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DialStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DialStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            DialStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DialStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DialStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DialStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DialStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DialStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
