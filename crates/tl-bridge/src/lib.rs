//! tl-bridge: streams a local PTY session to a remote peer
//!
//! The bridge keeps one duplex stream open to the peer, registers the session
//! on it, and turns the peer's commands into shell I/O. Three layers:
//!
//! - [`pty`]: the shell process attached to a pseudo-terminal
//! - [`transport`]: the stream itself, with heartbeats and reconnection
//! - [`orchestrator`]: the glue between the two
//!
//! [`host`] wraps an orchestrator for embedding applications.

pub mod host;
pub mod orchestrator;
pub mod pty;
pub mod transport;

pub use host::{ExitInfo, HostError, HostStartRequest, HostStartResponse, TerminalHost};
pub use orchestrator::{OrchestratorError, SessionEvent, SessionOrchestrator};
