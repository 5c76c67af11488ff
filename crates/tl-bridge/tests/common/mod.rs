//! Shared test harness: an in-memory stream connector standing in for the
//! remote peer.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;

use tl_bridge::transport::{DuplexStream, StreamConnector, TransportError};
use tl_core::BridgeConfig;
use tl_protocol::{agent_message, server_command, AgentMessage, ServerCommand, SessionId};

/// How long a test waits for the next message before failing
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector whose streams end in the test instead of on a network
pub struct MemoryConnector {
    accept: Box<dyn Fn(u32) -> bool + Send + Sync>,
    attempts: AtomicU32,
    attempt_times: Mutex<Vec<Instant>>,
    peers: mpsc::UnboundedSender<PeerHandle>,
}

impl MemoryConnector {
    /// `accept(n)` decides whether the n-th attempt (from 1) succeeds
    pub fn new(
        accept: impl Fn(u32) -> bool + Send + Sync + 'static,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerHandle>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accept: Box::new(accept),
            attempts: AtomicU32::new(0),
            attempt_times: Mutex::new(Vec::new()),
            peers,
        });
        (connector, peers_rx)
    }

    /// Every attempt succeeds
    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerHandle>) {
        Self::new(|_| true)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// When each attempt was made
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamConnector for MemoryConnector {
    async fn open(&self) -> Result<DuplexStream, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempt_times.lock().unwrap().push(Instant::now());

        if !(self.accept)(attempt) {
            return Err(TransportError::Connect {
                endpoint: "memory".to_string(),
                message: format!("attempt {} refused", attempt),
            });
        }

        let (outbound, from_agent) = mpsc::channel(64);
        let (to_agent, inbound_rx) = mpsc::channel(64);
        let _ = self.peers.send(PeerHandle {
            from_agent,
            to_agent,
            session: SessionId::new("peer"),
        });

        Ok(DuplexStream {
            outbound,
            inbound: ReceiverStream::new(inbound_rx).boxed(),
        })
    }

    fn endpoint(&self) -> &str {
        "memory"
    }
}

/// The peer's end of one accepted stream. Dropping it ends the stream.
pub struct PeerHandle {
    pub from_agent: mpsc::Receiver<AgentMessage>,
    pub to_agent: mpsc::Sender<Result<ServerCommand, TransportError>>,
    session: SessionId,
}

impl PeerHandle {
    /// Next message from the agent, whatever it is
    pub async fn recv(&mut self) -> AgentMessage {
        timeout(RECV_TIMEOUT, self.from_agent.recv())
            .await
            .expect("timed out waiting for agent message")
            .expect("agent closed the stream")
    }

    /// Next payload that is not a heartbeat
    pub async fn recv_payload(&mut self) -> agent_message::Payload {
        loop {
            let message = self.recv().await;
            match message.payload.expect("agent message without payload") {
                agent_message::Payload::Heartbeat(_) => continue,
                payload => return payload,
            }
        }
    }

    /// Skip messages until `pick` returns something
    pub async fn recv_until<T>(
        &mut self,
        mut pick: impl FnMut(&agent_message::Payload) -> Option<T>,
    ) -> T {
        loop {
            let payload = self.recv_payload().await;
            if let Some(found) = pick(&payload) {
                return found;
            }
        }
    }

    /// Whether the agent stays quiet (heartbeats aside) for `window`
    pub async fn expect_silence(&mut self, window: Duration) -> Option<agent_message::Payload> {
        let deadline = Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.from_agent.recv()).await {
                Err(_) | Ok(None) => return None,
                Ok(Some(message)) => match message.payload {
                    Some(agent_message::Payload::Heartbeat(_)) | None => continue,
                    Some(payload) => return Some(payload),
                },
            }
        }
    }

    /// Send a command and return its id
    pub async fn send(&self, payload: server_command::Payload) -> String {
        let command = ServerCommand::new(&self.session, payload);
        let id = command.command_id.clone();
        self.send_raw(command).await;
        id
    }

    pub async fn send_raw(&self, command: ServerCommand) {
        self.to_agent
            .send(Ok(command))
            .await
            .expect("agent stopped reading");
    }

    /// Break the stream with an error
    pub async fn fail(&self, message: &str) {
        let _ = self
            .to_agent
            .send(Err(TransportError::Stream(message.to_string())))
            .await;
    }
}

/// Wait for the next accepted stream
pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<PeerHandle>) -> PeerHandle {
    timeout(RECV_TIMEOUT, peers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Config with fast backoff and no heartbeats during a test
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.transport.heartbeat_interval = Duration::from_secs(3600);
    config.transport.backoff.initial = Duration::from_millis(10);
    config.transport.backoff.max = Duration::from_millis(100);
    config.pty.default_shell = Some("/bin/sh".to_string());
    config.pty.working_directory = Some(std::env::temp_dir());
    config
}
