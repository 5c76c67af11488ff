//! PTY process management

mod manager;
mod shell;

use std::path::PathBuf;

use thiserror::Error;

pub use manager::{
    ProcessManager, PtyEvent, SpawnOptions, PTY_EVENT_CHANNEL_CAPACITY, SIGKILL, SIGTERM,
};
pub use shell::{supported_shells, validate_shell};

/// Errors from the process manager
#[derive(Debug, Error)]
pub enum PtyError {
    /// A shell is already attached to this manager
    #[error("PTY process is already running")]
    AlreadyRunning,

    /// The requested shell does not exist
    #[error("Shell not found: {0}")]
    ShellNotFound(String),

    /// The requested working directory does not exist
    #[error("Working directory does not exist: {0:?}")]
    WorkingDirectory(PathBuf),

    /// Opening the PTY or spawning the shell failed
    #[error("{0}")]
    Spawn(String),

    /// Resizing the PTY failed
    #[error("Failed to resize PTY: {0}")]
    Resize(String),

    /// Signal delivery failed
    #[error("Failed to send signal {signal} to PID {pid}: {source}")]
    Signal {
        signal: i32,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// I/O error on the PTY
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}
