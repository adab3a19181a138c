//! Consensus RPC plumbing.
//!
//! Outbound: [`RaftClient`] implements the engine's network factory,
//! dialing peers through the stream layer (so every consensus connection
//! starts with the raft protocol byte and speaks the peer TLS config) and
//! caching one channel per peer. Requests and responses are the engine's
//! own types, serialized as JSON inside thin protobuf carrier messages.
//!
//! Inbound: [`RaftTransportService`] is the tonic service the agent mounts
//! on the raft half of the multiplexed listener; it unwraps the carriers
//! and hands the payloads to the local engine.

use crate::stream_layer::{PeerDialer, RPC_RAFT};
use crate::types::{LogRaft, NodeId, TypeConfig};
use logship_core::Error;
use logship_proto::raft::raft_transport_client::RaftTransportClient;
use logship_proto::raft::raft_transport_server::RaftTransport;
use logship_proto::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::error::{InstallSnapshotError, NetworkError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest as RaftAppendRequest, AppendEntriesResponse as RaftAppendResponse,
    InstallSnapshotRequest as RaftSnapshotRequest, InstallSnapshotResponse as RaftSnapshotResponse,
    VoteRequest as RaftVoteRequest, VoteResponse as RaftVoteResponse,
};
use openraft::BasicNode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

type RPCError<E = openraft::error::Infallible> =
    openraft::error::RPCError<NodeId, BasicNode, openraft::error::RaftError<NodeId, E>>;

/// Factory for consensus connections to peers.
#[derive(Clone)]
pub struct RaftClient {
    dialer: PeerDialer,
    connections: Arc<RwLock<HashMap<NodeId, Channel>>>,
}

impl RaftClient {
    pub fn new(dialer: PeerDialer) -> Self {
        Self {
            dialer,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn channel(&self, target: NodeId, addr: &str) -> Result<Channel, Error> {
        {
            let connections = self.connections.read();
            if let Some(channel) = connections.get(&target) {
                return Ok(channel.clone());
            }
        }

        let channel = self.dialer.dial(addr, RPC_RAFT).await?;

        let mut connections = self.connections.write();
        connections.insert(target, channel.clone());
        Ok(channel)
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftClient {
    type Network = RaftConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        RaftConnection {
            target,
            addr: node.addr.clone(),
            client: self.clone(),
        }
    }
}

/// A consensus connection to one peer.
pub struct RaftConnection {
    target: NodeId,
    addr: String,
    client: RaftClient,
}

impl RaftNetwork<TypeConfig> for RaftConnection {
    async fn append_entries(
        &mut self,
        req: RaftAppendRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<RaftAppendResponse<NodeId>, RPCError> {
        let channel = self
            .client
            .channel(self.target, &self.addr)
            .await
            .map_err(|e| network_error(&e))?;
        let mut client = RaftTransportClient::new(channel);

        let data = serde_json::to_vec(&req).map_err(|e| network_error(&e))?;
        let response = client
            .append_entries(AppendEntriesRequest { data })
            .await
            .map_err(|e| unreachable_error(&e))?;

        serde_json::from_slice(&response.into_inner().data).map_err(|e| network_error(&e))
    }

    async fn vote(
        &mut self,
        req: RaftVoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<RaftVoteResponse<NodeId>, RPCError> {
        let channel = self
            .client
            .channel(self.target, &self.addr)
            .await
            .map_err(|e| network_error(&e))?;
        let mut client = RaftTransportClient::new(channel);

        let data = serde_json::to_vec(&req).map_err(|e| network_error(&e))?;
        let response = client
            .vote(VoteRequest { data })
            .await
            .map_err(|e| unreachable_error(&e))?;

        serde_json::from_slice(&response.into_inner().data).map_err(|e| network_error(&e))
    }

    async fn install_snapshot(
        &mut self,
        req: RaftSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<RaftSnapshotResponse<NodeId>, RPCError<InstallSnapshotError>> {
        let channel = self
            .client
            .channel(self.target, &self.addr)
            .await
            .map_err(|e| network_error_snapshot(&e))?;
        let mut client = RaftTransportClient::new(channel);

        let data = serde_json::to_vec(&req).map_err(|e| network_error_snapshot(&e))?;
        let response = client
            .install_snapshot(InstallSnapshotRequest { data })
            .await
            .map_err(|e| unreachable_error_snapshot(&e))?;

        serde_json::from_slice(&response.into_inner().data).map_err(|e| network_error_snapshot(&e))
    }
}

fn network_error(err: &(impl std::error::Error + 'static)) -> RPCError {
    openraft::error::RPCError::Network(NetworkError::new(err))
}

fn unreachable_error(err: &Status) -> RPCError {
    openraft::error::RPCError::Unreachable(Unreachable::new(err))
}

fn network_error_snapshot(
    err: &(impl std::error::Error + 'static),
) -> RPCError<InstallSnapshotError> {
    openraft::error::RPCError::Network(NetworkError::new(err))
}

fn unreachable_error_snapshot(err: &Status) -> RPCError<InstallSnapshotError> {
    openraft::error::RPCError::Unreachable(Unreachable::new(err))
}

/// Server side of the consensus transport.
pub struct RaftTransportService {
    raft: LogRaft,
}

impl RaftTransportService {
    pub fn new(raft: LogRaft) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl RaftTransport for RaftTransportService {
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req: RaftAppendRequest<TypeConfig> = serde_json::from_slice(&request.into_inner().data)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let resp = self
            .raft
            .append_entries(req)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let data = serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(AppendEntriesResponse { data }))
    }

    async fn vote(&self, request: Request<VoteRequest>) -> Result<Response<VoteResponse>, Status> {
        let req: RaftVoteRequest<NodeId> = serde_json::from_slice(&request.into_inner().data)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let resp = self
            .raft
            .vote(req)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let data = serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(VoteResponse { data }))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        let req: RaftSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&request.into_inner().data)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let resp = self
            .raft
            .install_snapshot(req)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let data = serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(InstallSnapshotResponse { data }))
    }
}
