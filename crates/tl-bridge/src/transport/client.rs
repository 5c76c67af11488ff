//! Streaming transport client
//!
//! Owns one session's duplex stream: the registration handshake, the
//! outbound FIFO, heartbeats, and reconnection with backoff. Received
//! commands are handed to the owner as [`TransportEvent::Command`]; the
//! client itself knows nothing about PTYs.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tl_core::config::TransportConfig;
use tl_protocol::message::{Ack, ErrorReport, Heartbeat, Output, Register, StatusUpdate};
use tl_protocol::{agent_message, server_command, AgentMessage, ServerCommand, SessionId, SessionStatus};

use super::connector::{DuplexStream, StreamConnector, TransportError};
use super::reconnect::RetryPolicy;

/// Channel capacity for transport events
pub const TRANSPORT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Events from the transport to its owner
#[derive(Debug)]
pub enum TransportEvent {
    /// Registration sent on a fresh stream
    Connected,
    /// Stream lost, or manual disconnect
    Disconnected { reason: String },
    /// Command received from the peer, waiting to be handled
    Command(PendingCommand),
}

/// A received command. Call [`PendingCommand::complete`] once it has been
/// handled to acknowledge it.
#[derive(Debug)]
pub struct PendingCommand {
    pub command_id: String,
    pub payload: server_command::Payload,
    outbox: Outbox,
}

impl PendingCommand {
    /// Enqueue a successful ack for this command
    pub fn complete(self) {
        self.outbox.push(agent_message::Payload::Ack(Ack {
            command_id: self.command_id,
            success: true,
            message: String::new(),
        }));
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Static options for a transport client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub heartbeat_interval: Duration,
    /// Sent as the first message on every new stream
    pub register: Register,
}

impl ClientOptions {
    pub fn from_config(config: &TransportConfig, register: Register) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            register,
        }
    }
}

/// Producer side of the outbound FIFO
#[derive(Debug, Clone)]
struct Outbox {
    session_id: SessionId,
    queue: mpsc::UnboundedSender<AgentMessage>,
}

impl Outbox {
    fn push(&self, payload: agent_message::Payload) {
        let message = AgentMessage::new(&self.session_id, payload);
        tracing::trace!("Queueing {} message {}", message.kind(), message.message_id);
        // The receiver lives as long as the client
        let _ = self.queue.send(message);
    }
}

/// How one connection attempt ended
enum Attempt {
    /// Shutdown requested
    Cancelled,
    /// Never got as far as sending registration
    Failed(TransportError),
    /// Registered, then the stream ended
    Lost(TransportError),
}

/// Client for the bidirectional session stream
pub struct TransportClient {
    session_id: SessionId,
    connector: Arc<dyn StreamConnector>,
    options: ClientOptions,
    outbox: Outbox,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AgentMessage>>,
    sequence: Mutex<u64>,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<TransportEvent>,
}

impl TransportClient {
    /// Create a client. Events are delivered on the returned receiver.
    pub fn new(
        session_id: SessionId,
        connector: Arc<dyn StreamConnector>,
        options: ClientOptions,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::channel(TRANSPORT_EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let client = Self {
            outbox: Outbox {
                session_id: session_id.clone(),
                queue: queue_tx,
            },
            session_id,
            connector,
            options,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            sequence: Mutex::new(0),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            state,
            events,
        };
        (client, events_rx)
    }

    /// Drive the connection until [`disconnect`](Self::disconnect) is called
    /// or `policy` runs out of retries.
    ///
    /// Every failure is retried, whether opening the stream failed or an
    /// established stream broke. The backoff and the retry count reset once
    /// registration has been sent on a new stream.
    pub async fn connect_and_run(&self, policy: &RetryPolicy) -> Result<(), TransportError> {
        let token = {
            let mut shutdown = self.lock_shutdown();
            if self.running.swap(true, Ordering::SeqCst) {
                return Err(TransportError::AlreadyRunning);
            }
            *shutdown = CancellationToken::new();
            shutdown.clone()
        };

        self.discard_stale_messages().await;

        let mut backoff = policy.new_backoff();
        let mut failures: u32 = 0;
        let mut first_attempt = true;

        let result = loop {
            if token.is_cancelled() {
                break Ok(());
            }

            if first_attempt {
                tracing::info!("Connecting to {}", self.connector.endpoint());
            } else {
                let delay = backoff.next_delay();
                self.set_state(ConnectionState::Reconnecting);
                tracing::info!(
                    "Reconnecting to {} in {:?} (failed attempts: {})",
                    self.connector.endpoint(),
                    delay,
                    failures
                );
                tokio::select! {
                    _ = token.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first_attempt = false;
            self.set_state(ConnectionState::Connecting);

            match self.run_connection(&token).await {
                Attempt::Cancelled => break Ok(()),
                Attempt::Lost(e) => {
                    tracing::warn!("Connection lost: {}", e);
                    failures = 0;
                    backoff.reset();
                    self.set_state(ConnectionState::Reconnecting);
                    self.emit(
                        &token,
                        TransportEvent::Disconnected {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                }
                Attempt::Failed(e) => {
                    failures += 1;
                    tracing::warn!("Connection attempt {} failed: {}", failures, e);
                    if policy.exhausted(failures) {
                        tracing::error!("Giving up after {} failed attempts", failures);
                        break Err(TransportError::RetriesExhausted {
                            attempts: failures,
                            last: Box::new(e),
                        });
                    }
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        result
    }

    /// One attempt: open, register, then pump until something ends
    async fn run_connection(&self, token: &CancellationToken) -> Attempt {
        let stream = tokio::select! {
            _ = token.cancelled() => return Attempt::Cancelled,
            opened = self.connector.open() => match opened {
                Ok(stream) => stream,
                Err(e) => return Attempt::Failed(e),
            },
        };
        let DuplexStream { outbound, inbound } = stream;

        let register = AgentMessage::new(
            &self.session_id,
            agent_message::Payload::Register(self.options.register.clone()),
        );
        if outbound.send(register).await.is_err() {
            return Attempt::Failed(TransportError::Closed);
        }

        self.set_state(ConnectionState::Connected);
        tracing::info!(
            "Registered session {} with {}",
            self.session_id,
            self.connector.endpoint()
        );
        self.emit(token, TransportEvent::Connected).await;

        let ended = tokio::select! {
            _ = token.cancelled() => return Attempt::Cancelled,
            result = self.send_loop(&outbound) => result,
            result = self.receive_loop(inbound) => result,
            result = self.heartbeat_loop() => result,
        };

        // A cancelled token means the break was our own doing
        if token.is_cancelled() {
            return Attempt::Cancelled;
        }
        Attempt::Lost(ended.err().unwrap_or(TransportError::Closed))
    }

    /// Drain the outbound FIFO onto the stream, in order
    async fn send_loop(
        &self,
        outbound: &mpsc::Sender<AgentMessage>,
    ) -> Result<(), TransportError> {
        let mut queue = self.queue_rx.lock().await;
        while let Some(message) = queue.recv().await {
            tracing::debug!("Sending {} message {}", message.kind(), message.message_id);
            if outbound.send(message).await.is_err() {
                return Err(TransportError::Closed);
            }
        }
        Ok(())
    }

    /// Dispatch inbound commands until the stream ends
    async fn receive_loop(
        &self,
        mut inbound: BoxStream<'static, Result<ServerCommand, TransportError>>,
    ) -> Result<(), TransportError> {
        while let Some(item) = inbound.next().await {
            let command = item?;
            tracing::debug!("Received {} command {}", command.kind(), command.command_id);

            let Some(payload) = command.payload else {
                tracing::warn!(
                    "Ignoring command {} with unrecognized payload",
                    command.command_id
                );
                continue;
            };

            if let server_command::Payload::Ping(_) = payload {
                self.send_heartbeat();
                continue;
            }

            let pending = PendingCommand {
                command_id: command.command_id,
                payload,
                outbox: self.outbox.clone(),
            };
            if self.events.send(TransportEvent::Command(pending)).await.is_err() {
                tracing::warn!("Transport event receiver dropped; command discarded");
            }
        }
        Err(TransportError::Closed)
    }

    async fn heartbeat_loop(&self) -> Result<(), TransportError> {
        let period = self.options.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.send_heartbeat();
        }
    }

    /// Stop the connection loop. Idempotent; emits
    /// `Disconnected("Manual disconnect")` only when a run was active.
    pub fn disconnect(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Disconnecting session {}", self.session_id);
        self.lock_shutdown().cancel();
        self.set_state(ConnectionState::Disconnected);
        // Not async, so this one cannot wait for room
        if let Err(e) = self.events.try_send(TransportEvent::Disconnected {
            reason: "Manual disconnect".to_string(),
        }) {
            tracing::warn!("Dropping transport event: {}", e);
        }
    }

    /// Queue PTY output. Returns the sequence number it was given.
    pub fn send_output(&self, data: Vec<u8>, is_stderr: bool) -> u64 {
        // Held across the push so numbering matches queue order
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        *sequence += 1;
        self.outbox.push(agent_message::Payload::Output(Output {
            data,
            is_stderr,
            sequence: sequence.to_string(),
        }));
        *sequence
    }

    pub fn send_status(
        &self,
        old_status: SessionStatus,
        new_status: SessionStatus,
        reason: &str,
        working_directory: &str,
    ) {
        self.outbox.push(agent_message::Payload::Status(StatusUpdate {
            old_status: old_status.into(),
            new_status: new_status.into(),
            reason: reason.to_string(),
            working_directory: working_directory.to_string(),
        }));
    }

    pub fn send_error(&self, code: &str, message: &str, stack_trace: Option<&str>, is_fatal: bool) {
        self.outbox.push(agent_message::Payload::Error(ErrorReport {
            error_code: code.to_string(),
            message: message.to_string(),
            stack_trace: stack_trace.unwrap_or_default().to_string(),
            is_fatal,
        }));
    }

    pub fn send_ack(&self, command_id: &str, success: bool, message: &str) {
        self.outbox.push(agent_message::Payload::Ack(Ack {
            command_id: command_id.to_string(),
            success,
            message: message.to_string(),
        }));
    }

    pub fn send_heartbeat(&self) {
        self.outbox.push(agent_message::Payload::Heartbeat(Heartbeat {}));
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether `connect_and_run` is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Transport state: {} -> {}", previous, state);
        }
    }

    /// Deliver a lifecycle event with the same backpressure as commands
    async fn emit(&self, token: &CancellationToken, event: TransportEvent) {
        tokio::select! {
            _ = token.cancelled() => {}
            sent = self.events.send(event) => {
                if sent.is_err() {
                    tracing::debug!("Transport event receiver dropped");
                }
            }
        }
    }

    fn lock_shutdown(&self) -> MutexGuard<'_, CancellationToken> {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages left over from a previous run belong to a dead session
    async fn discard_stale_messages(&self) {
        let mut queue = self.queue_rx.lock().await;
        let mut discarded = 0usize;
        while queue.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!("Discarded {} messages from a previous run", discarded);
        }
    }
}
