//! Session orchestrator
//!
//! Joins the transport client and the process manager for one session:
//! commands from the peer drive the PTY, PTY events flow back to the peer and
//! to local subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use tl_core::BridgeConfig;
use tl_protocol::message::{Register, StartSession};
use tl_protocol::{server_command, SessionId, SessionStatus, TerminalSize, PROTOCOL_VERSION};

use crate::pty::{
    supported_shells, ProcessManager, PtyEvent, SpawnOptions, SIGKILL, SIGTERM,
};
use crate::transport::{
    ClientOptions, ConnectionState, PendingCommand, RetryPolicy, StreamConnector,
    TransportClient, TransportError, TransportEvent,
};

/// Error code reported when a shell fails to spawn
pub const PTY_START_FAILED: &str = "PTY_START_FAILED";

/// Error code for asynchronous PTY faults
pub const PTY_ERROR: &str = "PTY_ERROR";

/// Buffered local events per subscriber
pub const SESSION_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events published to local observers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw PTY output
    Output(Bytes),
    /// Human-readable status change
    Status(String),
    /// Non-fatal fault
    Error(String),
    /// The shell exited
    Exit { code: i32, signal: Option<i32> },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Drives one bridged terminal session
pub struct SessionOrchestrator {
    session_id: SessionId,
    transport: TransportClient,
    pty: ProcessManager,
    policy: RetryPolicy,
    transport_events: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
    pty_events: tokio::sync::Mutex<mpsc::Receiver<PtyEvent>>,
    status: Mutex<SessionStatus>,
    /// Id of the current run, zero when idle
    active_run: AtomicU64,
    next_run: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionOrchestrator {
    pub fn new(
        session_id: SessionId,
        config: &BridgeConfig,
        connector: Arc<dyn StreamConnector>,
    ) -> Self {
        let options = ClientOptions::from_config(&config.transport, registration(config));
        let (transport, transport_events) =
            TransportClient::new(session_id.clone(), connector, options);
        let (pty, pty_events) = ProcessManager::new(config.pty.clone());
        let (events, _) = broadcast::channel(SESSION_EVENT_CHANNEL_CAPACITY);

        Self {
            session_id,
            transport,
            pty,
            policy: RetryPolicy::from_config(&config.transport),
            transport_events: tokio::sync::Mutex::new(transport_events),
            pty_events: tokio::sync::Mutex::new(pty_events),
            status: Mutex::new(SessionStatus::Unspecified),
            active_run: AtomicU64::new(0),
            next_run: AtomicU64::new(0),
            events,
        }
    }

    /// Run the session until [`stop`](Self::stop) or until the transport
    /// gives up.
    ///
    /// This does not return while the session is healthy; observe progress
    /// through [`subscribe`](Self::subscribe).
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let run = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .active_run
            .compare_exchange(0, run, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OrchestratorError::AlreadyRunning);
        }
        tracing::info!("Starting session {}", self.session_id);

        // A previous run may still be unwinding after stop()
        let mut transport_events = self.transport_events.lock().await;
        let mut pty_events = self.pty_events.lock().await;
        if self.active_run.load(Ordering::SeqCst) != run {
            tracing::info!("Session {} stopped before it started", self.session_id);
            return Ok(());
        }
        // Leftovers from a previous run
        while transport_events.try_recv().is_ok() {}
        while pty_events.try_recv().is_ok() {}

        self.publish(SessionEvent::Status("connecting".to_string()));

        let result = tokio::select! {
            result = self.transport.connect_and_run(&self.policy) => result,
            _ = self.pump(&mut transport_events, &mut pty_events) => Ok(()),
        };

        // Nothing can reach a shell once the transport is gone
        self.pty.destroy();
        // Only if stop() has not already handed the session to a newer run
        let _ = self
            .active_run
            .compare_exchange(run, 0, Ordering::SeqCst, Ordering::SeqCst);

        if let Err(e) = &result {
            tracing::error!("Session {} failed: {}", self.session_id, e);
        }
        result.map_err(OrchestratorError::from)
    }

    /// Tear down the PTY, then the transport. No-op when not running.
    pub fn stop(&self) {
        if self.active_run.swap(0, Ordering::SeqCst) == 0 {
            return;
        }
        tracing::info!("Stopping session {}", self.session_id);
        self.pty.destroy();
        self.transport.disconnect();
        self.publish(SessionEvent::Status("stopped".to_string()));
    }

    async fn pump(
        &self,
        transport_events: &mut mpsc::Receiver<TransportEvent>,
        pty_events: &mut mpsc::Receiver<PtyEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
                Some(event) = pty_events.recv() => self.handle_pty_event(event),
                else => break,
            }
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.publish(SessionEvent::Status("registered".to_string()));
            }
            TransportEvent::Disconnected { reason } => {
                self.publish(SessionEvent::Status(format!("link down: {}", reason)));
            }
            TransportEvent::Command(command) => self.handle_command(command),
        }
    }

    fn handle_command(&self, command: PendingCommand) {
        tracing::debug!("Handling {} command {}", command.kind(), command.command_id);

        match &command.payload {
            server_command::Payload::Input(input) => {
                self.pty.write(&input.data);
                command.complete();
            }
            server_command::Payload::Resize(resize) => {
                let cols = u16::try_from(resize.cols).unwrap_or(u16::MAX);
                let rows = u16::try_from(resize.rows).unwrap_or(u16::MAX);
                if cols == 0 || rows == 0 {
                    tracing::warn!("Ignoring resize to {}x{}", resize.cols, resize.rows);
                } else {
                    self.pty.resize(cols, rows);
                }
                command.complete();
            }
            server_command::Payload::Signal(signal) => {
                self.pty.signal(signal.signal);
                command.complete();
            }
            server_command::Payload::StartSession(start) => {
                let outcome = self.start_shell(start);
                command.complete();
                match outcome {
                    Ok(reason) => self.set_status(SessionStatus::Connected, reason),
                    Err(message) => {
                        tracing::warn!("Failed to start shell: {}", message);
                        self.report_error(PTY_START_FAILED, &message);
                    }
                }
            }
            server_command::Payload::CloseSession(close) => {
                let signal = if close.force { SIGKILL } else { SIGTERM };
                self.pty.kill(signal);
                let reason = close.reason.clone();
                command.complete();
                self.set_status(SessionStatus::Disconnected, &reason);
            }
            server_command::Payload::Ping(_) => {
                // Answered by the transport's heartbeat
            }
        }
    }

    /// Spawn the shell unless one is already live
    fn start_shell(&self, start: &StartSession) -> Result<&'static str, String> {
        if self.pty.is_running() {
            tracing::info!("Start requested with a shell already running; reusing it");
            return Ok("already running");
        }

        let options = SpawnOptions {
            shell: non_empty(&start.shell),
            working_directory: non_empty(&start.working_directory),
            env: Vec::new(),
        };
        self.pty
            .start(options)
            .map(|_| "started")
            .map_err(|e| e.to_string())
    }

    fn handle_pty_event(&self, event: PtyEvent) {
        match event {
            PtyEvent::Data(data) => {
                self.transport.send_output(data.to_vec(), false);
                self.publish(SessionEvent::Output(data));
            }
            PtyEvent::Exit { code, signal } => {
                self.set_status(SessionStatus::Disconnected, &format!("Exit code: {}", code));
                self.publish(SessionEvent::Exit { code, signal });
            }
            PtyEvent::Error(e) => {
                self.report_error(PTY_ERROR, &e.to_string());
            }
        }
    }

    fn set_status(&self, new: SessionStatus, reason: &str) {
        let old = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *status, new)
        };
        let working_directory = self
            .pty
            .working_directory()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        tracing::info!("Session status {} -> {} ({})", old, new, reason);
        self.transport
            .send_status(old, new, reason, &working_directory);
        self.publish(SessionEvent::Status(new.to_string()));
    }

    fn report_error(&self, code: &str, message: &str) {
        self.transport.send_error(code, message, None, false);
        self.publish(SessionEvent::Error(message.to_string()));
    }

    fn publish(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Subscribe to local session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Write input straight to the PTY, bypassing the peer
    pub fn write(&self, data: &[u8]) {
        self.pty.write(data);
    }

    /// Resize the PTY directly
    pub fn resize(&self, cols: u16, rows: u16) {
        self.pty.resize(cols, rows);
    }

    pub fn is_running(&self) -> bool {
        self.active_run.load(Ordering::SeqCst) != 0
    }

    pub fn is_connected(&self) -> bool {
        self.transport.state() == ConnectionState::Connected
    }

    pub fn is_pty_running(&self) -> bool {
        self.pty.is_running()
    }

    /// Terminal size as `(cols, rows)`, kept across respawns
    pub fn pty_size(&self) -> (u16, u16) {
        self.pty.size()
    }

    /// Process id of the live shell
    pub fn pty_pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    /// Last status reported to the peer
    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

/// Handshake sent on every new stream
fn registration(config: &BridgeConfig) -> Register {
    Register {
        version: PROTOCOL_VERSION.to_string(),
        hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        platform: std::env::consts::OS.to_string(),
        supported_shells: supported_shells(&config.pty.resolved_shell(None)),
        initial_size: Some(TerminalSize::new(config.pty.cols, config.pty.rows)),
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
