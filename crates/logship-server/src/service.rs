//! gRPC implementation of the `Log` service.
//!
//! The service is constructed against the narrow `LogWriter`/`LogReader`
//! capabilities rather than a concrete log, so the same implementation
//! fronts a consensus-backed log on a cluster node and a plain commit log
//! in single-node setups and tests.

use crate::acl::Authorize;
use bytes::Bytes;
use logship_core::{Error, LogReader, LogWriter};
use logship_cluster::MuxConnectInfo;
use logship_proto::v1::log_server::Log;
use logship_proto::v1::{AppendRequest, AppendResponse, ReadRequest, ReadResponse, Record};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

const OBJECT_WILDCARD: &str = "*";
const ACTION_APPEND: &str = "append";
const ACTION_READ: &str = "read";

/// How long a following read stream sleeps before re-trying an offset
/// that is not yet available.
const READ_STREAM_POLL: Duration = Duration::from_millis(25);

pub struct LogService {
    writer: Arc<dyn LogWriter>,
    reader: Arc<dyn LogReader>,
    authorizer: Arc<dyn Authorize>,
}

impl LogService {
    pub fn new(
        writer: Arc<dyn LogWriter>,
        reader: Arc<dyn LogReader>,
        authorizer: Arc<dyn Authorize>,
    ) -> Self {
        Self {
            writer,
            reader,
            authorizer,
        }
    }
}

/// The caller's identity: the mutual-TLS common name the stream layer
/// attached, or empty on plaintext connections.
fn subject<T>(request: &Request<T>) -> String {
    request
        .extensions()
        .get::<MuxConnectInfo>()
        .and_then(|info| info.peer_subject.clone())
        .unwrap_or_default()
}

fn to_status(err: Error) -> Status {
    match err {
        Error::OffsetOutOfRange { offset } => {
            Status::out_of_range(format!("offset out of range: {offset}"))
        }
        Error::NotLeader { .. } => Status::failed_precondition(err.to_string()),
        Error::Timeout => Status::deadline_exceeded(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl Log for LogService {
    #[tracing::instrument(skip(self, request))]
    async fn append(
        &self,
        request: Request<AppendRequest>,
    ) -> Result<Response<AppendResponse>, Status> {
        let subject = subject(&request);
        self.authorizer
            .authorize(&subject, OBJECT_WILDCARD, ACTION_APPEND)?;

        let record = request
            .into_inner()
            .record
            .ok_or_else(|| Status::invalid_argument("record is required"))?;

        let offset = self
            .writer
            .append(Bytes::from(record.value))
            .await
            .map_err(to_status)?;
        Ok(Response::new(AppendResponse { offset }))
    }

    #[tracing::instrument(skip(self, request), fields(offset = request.get_ref().offset))]
    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadResponse>, Status> {
        let subject = subject(&request);
        self.authorizer
            .authorize(&subject, OBJECT_WILDCARD, ACTION_READ)?;

        let record = self
            .reader
            .read(request.into_inner().offset)
            .await
            .map_err(to_status)?;
        Ok(Response::new(ReadResponse {
            record: Some(Record {
                value: record.value.to_vec(),
                offset: record.offset,
            }),
        }))
    }

    type AppendStreamStream = ReceiverStream<Result<AppendResponse, Status>>;

    async fn append_stream(
        &self,
        request: Request<Streaming<AppendRequest>>,
    ) -> Result<Response<Self::AppendStreamStream>, Status> {
        let subject = subject(&request);
        let mut inbound = request.into_inner();
        let writer = Arc::clone(&self.writer);
        let authorizer = Arc::clone(&self.authorizer);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let request = match inbound.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };

                if let Err(e) = authorizer.authorize(&subject, OBJECT_WILDCARD, ACTION_APPEND) {
                    let _ = tx.send(Err(e.into())).await;
                    break;
                }

                let value = request.record.map(|r| r.value).unwrap_or_default();
                match writer.append(Bytes::from(value)).await {
                    Ok(offset) => {
                        if tx.send(Ok(AppendResponse { offset })).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(to_status(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ReadStreamStream = ReceiverStream<Result<ReadResponse, Status>>;

    async fn read_stream(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStreamStream>, Status> {
        let subject = subject(&request);
        let mut offset = request.into_inner().offset;
        let reader = Arc::clone(&self.reader);
        let authorizer = Arc::clone(&self.authorizer);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                if let Err(e) = authorizer.authorize(&subject, OBJECT_WILDCARD, ACTION_READ) {
                    let _ = tx.send(Err(e.into())).await;
                    break;
                }

                match reader.read(offset).await {
                    Ok(record) => {
                        let response = ReadResponse {
                            record: Some(Record {
                                value: record.value.to_vec(),
                                offset: record.offset,
                            }),
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            // Client went away; the stream ends cleanly.
                            break;
                        }
                        offset += 1;
                    }
                    // The caller has caught up. Not an error: keep polling
                    // until the offset exists or the client cancels.
                    Err(Error::OffsetOutOfRange { .. }) => {
                        if tx.is_closed() {
                            break;
                        }
                        tokio::time::sleep(READ_STREAM_POLL).await;
                    }
                    Err(e) => {
                        debug!(offset, %e, "read stream failed");
                        let _ = tx.send(Err(to_status(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
