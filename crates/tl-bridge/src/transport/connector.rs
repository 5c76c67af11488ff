//! Duplex stream connectors
//!
//! A connector opens one bidirectional message stream to the remote peer per
//! call. The transport client calls it again on every reconnect attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::Framed;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use tl_protocol::{AgentMessage, FrameCodec, ProtocolError, ServerCommand, CONNECT_PATH};

/// Capacity of the per-stream outbound buffer between the send loop and the
/// wire. The client's own queue is unbounded; this only smooths I/O.
pub const OUTBOUND_STREAM_CAPACITY: usize = 64;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The stream could not be established
    #[error("Failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    /// The stream failed after it was established
    #[error("Stream error: {0}")]
    Stream(String),

    /// The peer or the local writer closed the stream
    #[error("Stream closed")]
    Closed,

    /// Retry ceiling reached
    #[error("Giving up after {attempts} failed attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TransportError>,
    },

    /// Framing or protobuf error on a byte-stream transport
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Endpoint scheme not recognized
    #[error("Unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    /// `connect_and_run` called while a run is active
    #[error("Transport is already running")]
    AlreadyRunning,
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        TransportError::Stream(format!("{}: {}", status.code(), status.message()))
    }
}

/// One open duplex stream
pub struct DuplexStream {
    /// Messages to the peer; dropping it signals end-of-stream
    pub outbound: mpsc::Sender<AgentMessage>,
    /// Commands from the peer, ending when the peer closes
    pub inbound: BoxStream<'static, Result<ServerCommand, TransportError>>,
}

impl DuplexStream {
    /// Carry the protocol over any byte stream using length-prefixed frames
    pub fn framed<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let framed = Framed::new(io, FrameCodec::<AgentMessage, ServerCommand>::new());
        let (mut sink, stream) = framed.split::<AgentMessage>();
        let (outbound, mut outbound_rx) = mpsc::channel::<AgentMessage>(OUTBOUND_STREAM_CAPACITY);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::debug!("Framed writer stopped: {}", e);
                    return;
                }
            }
            // Sender dropped: half-close so the peer sees end-of-stream
            let _ = sink.close().await;
        });

        let inbound = stream.map(|item| item.map_err(TransportError::from)).boxed();
        Self { outbound, inbound }
    }
}

/// Opens duplex streams to the remote peer
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Open a new stream
    async fn open(&self) -> Result<DuplexStream, TransportError>;

    /// Human-readable peer address for logs
    fn endpoint(&self) -> &str;
}

/// Bidirectional gRPC streaming call on `TerminalBridge/Connect`
pub struct GrpcConnector {
    endpoint: String,
    connect_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
        }
    }

    fn connect_error(&self, message: impl ToString) -> TransportError {
        TransportError::Connect {
            endpoint: self.endpoint.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl StreamConnector for GrpcConnector {
    async fn open(&self) -> Result<DuplexStream, TransportError> {
        tracing::debug!("Opening gRPC channel to {}", self.endpoint);
        let channel: Channel = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| self.connect_error(e))?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true)
            .connect()
            .await
            .map_err(|e| self.connect_error(e))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await.map_err(|e| self.connect_error(e))?;

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_STREAM_CAPACITY);
        let request = tonic::Request::new(ReceiverStream::new(outbound_rx));
        let codec: tonic::codec::ProstCodec<AgentMessage, ServerCommand> =
            tonic::codec::ProstCodec::default();

        let response = grpc
            .streaming(request, PathAndQuery::from_static(CONNECT_PATH), codec)
            .await
            .map_err(|status| self.connect_error(status.message()))?;

        let inbound = response
            .into_inner()
            .map(|item| item.map_err(TransportError::from))
            .boxed();

        Ok(DuplexStream { outbound, inbound })
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// TCP with length-prefixed protobuf frames
pub struct FramedTcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl FramedTcpConnector {
    /// `address` is `host:port`
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl StreamConnector for FramedTcpConnector {
    async fn open(&self) -> Result<DuplexStream, TransportError> {
        tracing::debug!("Connecting to {}", self.address);
        let stream = tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(&self.address),
        )
        .await
        .map_err(|_| TransportError::Connect {
            endpoint: self.address.clone(),
            message: "Connection timed out".to_string(),
        })?
        .map_err(|e| TransportError::Connect {
            endpoint: self.address.clone(),
            message: e.to_string(),
        })?;

        let _ = stream.set_nodelay(true);
        Ok(DuplexStream::framed(stream))
    }

    fn endpoint(&self) -> &str {
        &self.address
    }
}

/// Pick a connector from the endpoint scheme.
///
/// `http://` uses gRPC, `tcp://host:port` uses framed TCP.
pub fn connector_for_endpoint(
    endpoint: &str,
    connect_timeout: Duration,
) -> Result<Arc<dyn StreamConnector>, TransportError> {
    if let Some(address) = endpoint.strip_prefix("tcp://") {
        return Ok(Arc::new(FramedTcpConnector::new(address, connect_timeout)));
    }
    if endpoint.starts_with("http://") {
        return Ok(Arc::new(GrpcConnector::new(endpoint, connect_timeout)));
    }
    Err(TransportError::UnsupportedEndpoint(endpoint.to_string()))
}
