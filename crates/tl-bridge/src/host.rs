//! Host-process boundary
//!
//! [`TerminalHost`] is what an embedding application talks to: start a
//! session, feed it input, resize it, stop it, and subscribe to four event
//! channels (output bytes, status strings, error strings, exits).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tl_core::BridgeConfig;
use tl_protocol::SessionId;

use crate::orchestrator::{SessionEvent, SessionOrchestrator, SESSION_EVENT_CHANNEL_CAPACITY};
use crate::transport::{connector_for_endpoint, StreamConnector, TransportError};

/// Parameters for [`TerminalHost::start`]
#[derive(Debug, Clone, Default)]
pub struct HostStartRequest {
    /// Reuse this id; a UUID is generated when absent
    pub session_id: Option<String>,
    pub shell: Option<String>,
    pub working_directory: Option<String>,
    /// Zero keeps the configured size
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStartResponse {
    pub session_id: String,
}

/// Shell exit as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
    pub signal: Option<i32>,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("A session is already active")]
    AlreadyStarted,

    #[error("No active session")]
    NotStarted,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ActiveSession {
    orchestrator: Arc<SessionOrchestrator>,
    run: JoinHandle<()>,
}

/// Entry point for an application embedding one bridged terminal
pub struct TerminalHost {
    config: BridgeConfig,
    connector: Option<Arc<dyn StreamConnector>>,
    active: Mutex<Option<ActiveSession>>,
    output: broadcast::Sender<Bytes>,
    status: broadcast::Sender<String>,
    errors: broadcast::Sender<String>,
    exits: broadcast::Sender<ExitInfo>,
}

impl TerminalHost {
    /// Connector chosen from `config.endpoint` on each start
    pub fn new(config: BridgeConfig) -> Self {
        Self::build(config, None)
    }

    /// Use a fixed connector instead of resolving the endpoint
    pub fn with_connector(config: BridgeConfig, connector: Arc<dyn StreamConnector>) -> Self {
        Self::build(config, Some(connector))
    }

    fn build(config: BridgeConfig, connector: Option<Arc<dyn StreamConnector>>) -> Self {
        let (output, _) = broadcast::channel(SESSION_EVENT_CHANNEL_CAPACITY);
        let (status, _) = broadcast::channel(64);
        let (errors, _) = broadcast::channel(64);
        let (exits, _) = broadcast::channel(16);

        Self {
            config,
            connector,
            active: Mutex::new(None),
            output,
            status,
            errors,
            exits,
        }
    }

    /// Start a session in the background and return its id.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(&self, request: HostStartRequest) -> Result<HostStartResponse, HostError> {
        let mut active = self.lock_active();
        if active
            .as_ref()
            .is_some_and(|session| !session.run.is_finished())
        {
            return Err(HostError::AlreadyStarted);
        }

        let mut config = self.config.clone();
        if let Some(shell) = request.shell.filter(|s| !s.is_empty()) {
            config.pty.default_shell = Some(shell);
        }
        if let Some(cwd) = request.working_directory.filter(|s| !s.is_empty()) {
            config.pty.working_directory = Some(cwd.into());
        }
        if request.cols > 0 && request.rows > 0 {
            config.pty.cols = request.cols;
            config.pty.rows = request.rows;
        }

        let session_id = request
            .session_id
            .or_else(|| config.session_id.clone())
            .map(SessionId::new)
            .unwrap_or_else(SessionId::generate);

        let connector = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => connector_for_endpoint(&config.endpoint, config.transport.connect_timeout)?,
        };

        tracing::info!("Starting host session {} via {}", session_id, connector.endpoint());
        let orchestrator = Arc::new(SessionOrchestrator::new(
            session_id.clone(),
            &config,
            connector,
        ));

        self.spawn_forwarder(orchestrator.subscribe());

        let runner = Arc::clone(&orchestrator);
        let status = self.status.clone();
        let errors = self.errors.clone();
        let run = tokio::spawn(async move {
            if let Err(e) = runner.start().await {
                let _ = errors.send(e.to_string());
                let _ = status.send(format!("failed: {}", e));
            }
        });

        *active = Some(ActiveSession { orchestrator, run });
        Ok(HostStartResponse {
            session_id: session_id.to_string(),
        })
    }

    /// Stop the active session and wait for it to wind down. No-op when idle.
    pub async fn stop(&self) {
        let session = self.lock_active().take();
        let Some(session) = session else {
            return;
        };
        session.orchestrator.stop();
        drop(session.orchestrator);
        if let Err(e) = session.run.await {
            tracing::warn!("Session task ended abnormally: {}", e);
        }
    }

    /// Feed raw input to the active shell
    pub fn write_input(&self, data: &[u8]) -> Result<(), HostError> {
        self.with_session(|orchestrator| orchestrator.write(data))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), HostError> {
        self.with_session(|orchestrator| orchestrator.resize(cols, rows))
    }

    /// Id of the active session, if any
    pub fn session_id(&self) -> Option<String> {
        self.lock_active()
            .as_ref()
            .map(|session| session.orchestrator.session_id().to_string())
    }

    pub fn is_connected(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|session| session.orchestrator.is_connected())
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.output.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<String> {
        self.status.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    pub fn subscribe_exit(&self) -> broadcast::Receiver<ExitInfo> {
        self.exits.subscribe()
    }

    fn with_session(&self, f: impl FnOnce(&SessionOrchestrator)) -> Result<(), HostError> {
        let active = self.lock_active();
        let session = active.as_ref().ok_or(HostError::NotStarted)?;
        f(&session.orchestrator);
        Ok(())
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fan session events out to the per-kind channels. Ends when the
    /// orchestrator is dropped.
    fn spawn_forwarder(&self, mut events: broadcast::Receiver<SessionEvent>) {
        let output = self.output.clone();
        let status = self.status.clone();
        let errors = self.errors.clone();
        let exits = self.exits.clone();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Host forwarder lagged, skipped {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                // Send errors only mean nobody is subscribed
                match event {
                    SessionEvent::Output(data) => {
                        let _ = output.send(data);
                    }
                    SessionEvent::Status(text) => {
                        let _ = status.send(text);
                    }
                    SessionEvent::Error(text) => {
                        let _ = errors.send(text);
                    }
                    SessionEvent::Exit { code, signal } => {
                        let _ = exits.send(ExitInfo { code, signal });
                    }
                }
            }
        });
    }
}

impl Drop for TerminalHost {
    fn drop(&mut self) {
        if let Some(session) = self.lock_active().take() {
            session.orchestrator.stop();
        }
    }
}
