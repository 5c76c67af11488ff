//! Message types for the termlink protocol
//!
//! These types mirror `proto/termlink.proto` field-for-field. They are derived
//! by hand with `prost` so the crate builds without a protobuf compiler.
//!
//! # Message Flow
//!
//! 1. Agent opens the `Connect` stream and sends `Register`
//! 2. Agent sends `Heartbeat` periodically; server may send `Ping` at any time
//! 3. Server sends `StartSession`, agent answers with `Ack` and `StatusUpdate`
//! 4. Terminal I/O: `Input` flows to the agent, `Output` flows back
//! 5. Window resize: `Resize` from the server
//! 6. Session end: `CloseSession` from the server, or a `StatusUpdate`
//!    (`DISCONNECTED`) from the agent when the shell exits
//!
//! Every command except `Ping` is acknowledged with an `Ack` carrying its
//! `command_id`. Commands with an unrecognized payload decode with
//! `payload: None` and are ignored by the agent.

use std::fmt;
use std::time::SystemTime;

use crate::session::SessionId;

/// Current protocol version, reported in `Register`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Fully-qualified gRPC method path of the duplex stream.
pub const CONNECT_PATH: &str = "/termlink.v1.TerminalBridge/Connect";

/// Session readiness as reported to the remote peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SessionStatus {
    Unspecified = 0,
    Connected = 1,
    Disconnected = 2,
}

impl SessionStatus {
    /// Lowercase name used in logs and local status channels
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Unspecified => "unspecified",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal dimensions
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct TerminalSize {
    #[prost(uint32, tag = "1")]
    pub cols: u32,
    #[prost(uint32, tag = "2")]
    pub rows: u32,
    /// Pixel width, 0 when unknown
    #[prost(uint32, tag = "3")]
    pub width: u32,
    /// Pixel height, 0 when unknown
    #[prost(uint32, tag = "4")]
    pub height: u32,
}

impl TerminalSize {
    /// Create a size with unknown pixel dimensions
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.into(),
            rows: rows.into(),
            width: 0,
            height: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent -> server
// ---------------------------------------------------------------------------

/// Outbound envelope
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentMessage {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(string, tag = "2")]
    pub message_id: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(oneof = "agent_message::Payload", tags = "10, 11, 12, 13, 14, 15")]
    pub payload: Option<agent_message::Payload>,
}

pub mod agent_message {
    /// Outbound payload variants
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Register(super::Register),
        #[prost(message, tag = "11")]
        Output(super::Output),
        #[prost(message, tag = "12")]
        Status(super::StatusUpdate),
        #[prost(message, tag = "13")]
        Error(super::ErrorReport),
        #[prost(message, tag = "14")]
        Ack(super::Ack),
        #[prost(message, tag = "15")]
        Heartbeat(super::Heartbeat),
    }

    impl Payload {
        /// Short name of the variant, for logging
        pub fn kind(&self) -> &'static str {
            match self {
                Payload::Register(_) => "register",
                Payload::Output(_) => "output",
                Payload::Status(_) => "status",
                Payload::Error(_) => "error",
                Payload::Ack(_) => "ack",
                Payload::Heartbeat(_) => "heartbeat",
            }
        }
    }
}

impl AgentMessage {
    /// Wrap a payload in a fresh envelope (new message id, current time)
    pub fn new(session_id: &SessionId, payload: agent_message::Payload) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Some(timestamp_now()),
            payload: Some(payload),
        }
    }

    /// Variant name of the payload
    pub fn kind(&self) -> &'static str {
        self.payload.as_ref().map_or("empty", |p| p.kind())
    }
}

/// Capability/version handshake, sent once per connection
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Register {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(string, tag = "2")]
    pub hostname: String,
    #[prost(string, tag = "3")]
    pub platform: String,
    #[prost(string, repeated, tag = "4")]
    pub supported_shells: Vec<String>,
    #[prost(message, optional, tag = "5")]
    pub initial_size: Option<TerminalSize>,
}

/// A chunk of PTY output
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Output {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub is_stderr: bool,
    /// Decimal, strictly increasing per session
    #[prost(string, tag = "3")]
    pub sequence: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusUpdate {
    #[prost(enumeration = "SessionStatus", tag = "1")]
    pub old_status: i32,
    #[prost(enumeration = "SessionStatus", tag = "2")]
    pub new_status: i32,
    #[prost(string, tag = "3")]
    pub reason: String,
    #[prost(string, tag = "4")]
    pub working_directory: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorReport {
    #[prost(string, tag = "1")]
    pub error_code: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub stack_trace: String,
    #[prost(bool, tag = "4")]
    pub is_fatal: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Heartbeat {}

// ---------------------------------------------------------------------------
// Server -> agent
// ---------------------------------------------------------------------------

/// Inbound envelope
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerCommand {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(oneof = "server_command::Payload", tags = "10, 11, 12, 13, 14, 15")]
    pub payload: Option<server_command::Payload>,
}

pub mod server_command {
    /// Inbound payload variants
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Input(super::Input),
        #[prost(message, tag = "11")]
        Resize(super::Resize),
        #[prost(message, tag = "12")]
        StartSession(super::StartSession),
        #[prost(message, tag = "13")]
        CloseSession(super::CloseSession),
        #[prost(message, tag = "14")]
        Signal(super::Signal),
        #[prost(message, tag = "15")]
        Ping(super::Ping),
    }

    impl Payload {
        /// Short name of the variant, for logging
        pub fn kind(&self) -> &'static str {
            match self {
                Payload::Input(_) => "input",
                Payload::Resize(_) => "resize",
                Payload::StartSession(_) => "start_session",
                Payload::CloseSession(_) => "close_session",
                Payload::Signal(_) => "signal",
                Payload::Ping(_) => "ping",
            }
        }
    }
}

impl ServerCommand {
    /// Build a command with a fresh command id
    pub fn new(session_id: &SessionId, payload: server_command::Payload) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            timestamp: Some(timestamp_now()),
            payload: Some(payload),
        }
    }

    /// Variant name of the payload, `"unknown"` when the kind was not recognized
    pub fn kind(&self) -> &'static str {
        self.payload.as_ref().map_or("unknown", |p| p.kind())
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Input {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Resize {
    #[prost(uint32, tag = "1")]
    pub cols: u32,
    #[prost(uint32, tag = "2")]
    pub rows: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartSession {
    /// Empty means "use the agent's default shell"
    #[prost(string, tag = "1")]
    pub shell: String,
    /// Empty means "use the agent's default directory"
    #[prost(string, tag = "2")]
    pub working_directory: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseSession {
    #[prost(string, tag = "1")]
    pub reason: String,
    #[prost(bool, tag = "2")]
    pub force: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Signal {
    #[prost(int32, tag = "1")]
    pub signal: i32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Ping {}

/// Current wall-clock time as a protobuf timestamp
pub fn timestamp_now() -> prost_types::Timestamp {
    prost_types::Timestamp::from(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    /// A command kind this agent does not know about yet
    #[derive(Clone, PartialEq, ::prost::Message)]
    struct FutureCommand {
        #[prost(string, tag = "1")]
        command_id: String,
        #[prost(message, optional, tag = "42")]
        teleport: Option<Ping>,
    }

    #[test]
    fn test_unknown_command_kind_decodes_without_payload() {
        let future = FutureCommand {
            command_id: "cmd-7".to_string(),
            teleport: Some(Ping {}),
        };
        let bytes = future.encode_to_vec();

        let decoded = ServerCommand::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.command_id, "cmd-7");
        assert!(decoded.payload.is_none());
        assert_eq!(decoded.kind(), "unknown");
    }

    #[test]
    fn test_envelope_has_fresh_ids() {
        let session = SessionId::new("s1");
        let a = AgentMessage::new(&session, agent_message::Payload::Heartbeat(Heartbeat {}));
        let b = AgentMessage::new(&session, agent_message::Payload::Heartbeat(Heartbeat {}));

        assert_eq!(a.session_id, "s1");
        assert_ne!(a.message_id, b.message_id);
        assert!(a.timestamp.is_some());
        assert_eq!(a.kind(), "heartbeat");
    }

    #[test]
    fn test_status_enumeration() {
        let update = StatusUpdate {
            old_status: SessionStatus::Unspecified as i32,
            new_status: SessionStatus::Connected as i32,
            reason: "ready".to_string(),
            working_directory: "/tmp".to_string(),
        };
        let decoded = StatusUpdate::decode(update.encode_to_vec().as_slice()).unwrap();

        assert_eq!(
            SessionStatus::try_from(decoded.new_status).unwrap(),
            SessionStatus::Connected
        );
        assert!(SessionStatus::try_from(99).is_err());
        assert_eq!(SessionStatus::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_terminal_size_new() {
        let size = TerminalSize::new(120, 40);
        assert_eq!((size.cols, size.rows), (120, 40));
        assert_eq!((size.width, size.height), (0, 0));
    }
}
