//! Request/response routing over transport streams.
//!
//! An outbound call opens a stream on the topic's protocol name, writes the
//! encoded request (nothing for bodyless topics), closes the write side and
//! reads back one status byte plus an optional body. Inbound streams are
//! decoded by topic and dispatched to the registered handler; handlers never
//! see transport framing.

pub mod codec;
pub mod methods;
pub mod protocol;

pub use methods::{RequestPayload, ResponsePayload};
pub use protocol::{RpcError, RpcStatus, Topic};

use futures::future::BoxFuture;
use libp2p::PeerId;
use ssz::Decode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::NodeConfig;
use crate::metrics;
use crate::network::{InboundStream, Substream, Transport};
use crate::peers::{PeerRegistry, SessionState};
use methods::ErrorBody;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub network: String,
    pub max_message_size: usize,
    pub request_timeout: Duration,
    pub response_timeout: Duration,
    pub handle_timeout: Duration,
}

impl RouterConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            network: config.network.clone(),
            max_message_size: config.p2p.max_message_size,
            request_timeout: config.p2p.request_timeout,
            response_timeout: config.p2p.response_timeout,
            handle_timeout: config.p2p.handle_timeout,
        }
    }
}

/// Successful (or soft-refused) outcome of an outbound call.
#[derive(Debug)]
pub struct RpcReply {
    pub status: RpcStatus,
    pub payload: ResponsePayload,
}

/// What a handler produced: success or the soft DAG-consensus refusal, both
/// carrying a valid payload.
#[derive(Debug)]
pub struct HandlerResponse {
    pub status: RpcStatus,
    pub payload: ResponsePayload,
}

impl HandlerResponse {
    pub fn ok(payload: ResponsePayload) -> Self {
        Self {
            status: RpcStatus::Success,
            payload,
        }
    }

    pub fn dag_consensus(payload: ResponsePayload) -> Self {
        Self {
            status: RpcStatus::DagConsensus,
            payload,
        }
    }
}

/// Hard refusal produced by a handler, mapped to a status byte and an
/// optional reason body on the wire.
#[derive(Debug)]
pub struct HandlerError {
    pub status: RpcStatus,
    pub reason: String,
}

impl HandlerError {
    pub fn new(status: RpcStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        peer: PeerId,
        request: RequestPayload,
    ) -> BoxFuture<'static, Result<HandlerResponse, HandlerError>>;
}

pub struct ProtocolRouter {
    config: RouterConfig,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerRegistry>,
}

impl ProtocolRouter {
    pub fn new(
        config: RouterConfig,
        transport: Arc<dyn Transport>,
        peers: Arc<PeerRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            peers,
        })
    }

    pub fn network(&self) -> &str {
        &self.config.network
    }

    /// Perform one outbound exchange. Stream-class failures and hard remote
    /// errors count against the peer's reputation; the soft DAG-consensus
    /// status does not.
    pub async fn send(&self, peer: PeerId, request: RequestPayload) -> Result<RpcReply, RpcError> {
        let topic = request.topic();
        let result = self.send_inner(peer, topic, &request).await;
        if let Err(err) = &result {
            let status = err.status();
            trace!(%peer, topic = %topic, %err, "outbound call failed");
            metrics::RPC_FAILURES.with_label_values(&[topic.as_ref()]).inc();
            if status.penalizes_reputation() {
                self.peers.increment_bad_response(&peer, status).await;
            }
        }
        result
    }

    async fn send_inner(
        &self,
        peer: PeerId,
        topic: Topic,
        request: &RequestPayload,
    ) -> Result<RpcReply, RpcError> {
        let name = topic.protocol_name(&self.config.network);
        let mut io = self
            .transport
            .open_stream(&peer, &name)
            .await
            .map_err(|e| RpcError::StreamBase(e.to_string()))?;

        let body = request.encode();
        timeout(self.config.request_timeout, async {
            if topic.has_request_body() {
                codec::write_frame(
                    &mut io,
                    &body,
                    topic.max_request_len(self.config.max_message_size),
                )
                .await?;
            }
            io.shutdown()
                .await
                .map_err(|e| RpcError::StreamWrite(e.to_string()))
        })
        .await
        .map_err(|_| RpcError::RequestTimeout)??;

        if let Some(record) = self.peers.get(&peer).await {
            record.note_send(body.len() as u64).await;
        }

        let reply = timeout(self.config.response_timeout, async {
            let status = codec::read_status(&mut io).await?;
            if status.is_success() || status.is_dag_consensus() {
                let payload = if topic.has_response_body() {
                    let bytes = codec::read_frame(
                        &mut io,
                        topic.max_response_len(self.config.max_message_size),
                    )
                    .await?;
                    if let Some(record) = self.peers.get(&peer).await {
                        record.note_recv(bytes.len() as u64).await;
                    }
                    ResponsePayload::decode(topic, &bytes)?
                } else {
                    ResponsePayload::Ack
                };
                Ok(RpcReply { status, payload })
            } else {
                // Hard failure; a structured reason body may follow.
                let reason = match codec::read_frame(&mut io, 1024).await {
                    Ok(bytes) => ErrorBody::from_ssz_bytes(&bytes)
                        .map(|e| e.as_string())
                        .unwrap_or_default(),
                    Err(_) => String::new(),
                };
                Err(RpcError::Remote { status, reason })
            }
        })
        .await
        .map_err(|_| RpcError::ResponseTimeout)??;

        Ok(reply)
    }

    /// Run the inbound dispatch loop until the transport closes or shutdown
    /// is signalled. Each stream is served on its own task.
    pub fn spawn_inbound(
        self: &Arc<Self>,
        handler: Arc<dyn Handler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    inbound = router.transport.next_inbound() => {
                        let Some(stream) = inbound else { break };
                        let router = router.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            router.handle_inbound(stream, handler).await;
                        });
                    }
                }
            }
        });
    }

    async fn handle_inbound(&self, stream: InboundStream, handler: Arc<dyn Handler>) {
        let InboundStream {
            peer,
            protocol,
            mut io,
        } = stream;

        let Some(topic) = Topic::from_protocol_name(&self.config.network, &protocol) else {
            debug!(%peer, %protocol, "resetting stream with unsupported protocol");
            return;
        };

        match timeout(
            self.config.handle_timeout,
            self.serve(peer, topic, &mut io, handler),
        )
        .await
        {
            Ok(Ok(status)) => {
                // Answered; close the stream normally.
                let _ = io.shutdown().await;
                if status.penalizes_reputation() {
                    self.peers.increment_bad_response(&peer, status).await;
                }
            }
            Ok(Err(err)) => {
                // Stream-class failure: drop without a graceful close.
                debug!(%peer, topic = %topic, %err, "inbound stream failed");
                self.peers.increment_bad_response(&peer, err.status()).await;
            }
            Err(_) => {
                warn!(%peer, topic = %topic, "inbound handler deadline exceeded");
                self.peers
                    .increment_bad_response(&peer, RpcStatus::StreamBase)
                    .await;
            }
        }
    }

    /// Decode, dispatch and answer one inbound request. Returns the status
    /// that went on the wire; `Err` means the stream itself failed.
    async fn serve(
        &self,
        peer: PeerId,
        topic: Topic,
        io: &mut Substream,
        handler: Arc<dyn Handler>,
    ) -> Result<RpcStatus, RpcError> {
        let record = self.peers.get(&peer).await;

        if !topic.allowed_before_handshake() {
            let connected = match &record {
                Some(record) => record.state().await == SessionState::Connected,
                None => false,
            };
            if !connected {
                return self
                    .refuse(io, RpcStatus::PeerUnknown, "handshake not completed")
                    .await;
            }
        }

        let request = if topic.has_request_body() {
            let bytes = match codec::read_frame(
                io,
                topic.max_request_len(self.config.max_message_size),
            )
            .await
            {
                Ok(bytes) => bytes,
                Err(RpcError::InvalidData(reason)) => {
                    return self.refuse(io, RpcStatus::Message, &reason).await;
                }
                Err(err) => return Err(err),
            };
            if let Some(record) = &record {
                record.note_recv(bytes.len() as u64).await;
            }
            match RequestPayload::decode(topic, &bytes) {
                Ok(request) => request,
                Err(_) => {
                    return self
                        .refuse(io, RpcStatus::Message, "undecodable request body")
                        .await;
                }
            }
        } else {
            RequestPayload::decode(topic, &[])?
        };

        match handler.handle(peer, request).await {
            Ok(response) => {
                codec::write_status(io, response.status).await?;
                if topic.has_response_body() {
                    let body = response.payload.encode();
                    codec::write_frame(
                        io,
                        &body,
                        topic.max_response_len(self.config.max_message_size),
                    )
                    .await?;
                    if let Some(record) = &record {
                        record.note_send(body.len() as u64).await;
                    }
                }
                Ok(response.status)
            }
            Err(refusal) => self.refuse(io, refusal.status, &refusal.reason).await,
        }
    }

    async fn refuse(
        &self,
        io: &mut Substream,
        status: RpcStatus,
        reason: &str,
    ) -> Result<RpcStatus, RpcError> {
        codec::write_status(io, status).await?;
        if !reason.is_empty() {
            let body = ErrorBody::new(reason);
            codec::write_frame(io, &ssz::Encode::as_ssz_bytes(&body), 1024).await?;
        }
        Ok(status)
    }
}
