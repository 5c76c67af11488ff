//! Duplex stream transport to the remote peer
//!
//! [`TransportClient`] keeps one session registered with the peer across
//! reconnects. [`StreamConnector`] implementations supply the actual stream:
//! gRPC bidirectional streaming or length-prefixed frames over TCP.

mod client;
mod connector;
mod reconnect;

pub use client::{
    ClientOptions, ConnectionState, PendingCommand, TransportClient, TransportEvent,
    TRANSPORT_EVENT_CHANNEL_CAPACITY,
};
pub use connector::{
    connector_for_endpoint, DuplexStream, FramedTcpConnector, GrpcConnector, StreamConnector,
    TransportError, OUTBOUND_STREAM_CAPACITY,
};
pub use reconnect::{ExponentialBackoff, RetryPolicy};
