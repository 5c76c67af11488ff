//! tl-protocol: Wire schema for termlink terminal streaming
//!
//! This crate defines the protobuf messages exchanged between a bridge agent
//! and its remote peer, and a frame codec for carrying them over plain byte
//! streams. Over gRPC the same messages travel on the `Connect` method.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod session;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    agent_message, server_command, AgentMessage, ServerCommand, SessionStatus, TerminalSize,
    CONNECT_PATH, PROTOCOL_VERSION,
};
pub use session::SessionId;
