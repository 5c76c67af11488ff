//! Session orchestrator integration tests
//!
//! A real `/bin/sh` behind the orchestrator, the in-memory connector in front.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use common::{next_peer, test_config, MemoryConnector, PeerHandle, RECV_TIMEOUT};
use tl_bridge::orchestrator::{OrchestratorError, PTY_START_FAILED};
use tl_bridge::{SessionEvent, SessionOrchestrator};
use tl_protocol::message::{CloseSession, Input, Resize, Signal, StartSession, StatusUpdate};
use tl_protocol::{agent_message, server_command, SessionId, SessionStatus};

struct Harness {
    orchestrator: Arc<SessionOrchestrator>,
    run: JoinHandle<Result<(), OrchestratorError>>,
    peer: PeerHandle,
}

async fn start_session() -> Harness {
    let (connector, mut peers) = MemoryConnector::accepting();
    let orchestrator = Arc::new(SessionOrchestrator::new(
        SessionId::new("orch-test"),
        &test_config(),
        connector,
    ));
    let runner = Arc::clone(&orchestrator);
    let run = tokio::spawn(async move { runner.start().await });

    let mut peer = next_peer(&mut peers).await;
    assert!(matches!(
        peer.recv().await.payload,
        Some(agent_message::Payload::Register(_))
    ));
    Harness {
        orchestrator,
        run,
        peer,
    }
}

async fn start_shell(peer: &mut PeerHandle) -> String {
    peer.send(server_command::Payload::StartSession(StartSession {
        shell: "/bin/sh".to_string(),
        working_directory: "/tmp".to_string(),
    }))
    .await
}

fn status_of(payload: &agent_message::Payload) -> Option<StatusUpdate> {
    match payload {
        agent_message::Payload::Status(status) => Some(status.clone()),
        _ => None,
    }
}

fn ack_of(payload: &agent_message::Payload) -> Option<String> {
    match payload {
        agent_message::Payload::Ack(ack) => Some(ack.command_id.clone()),
        _ => None,
    }
}

async fn stop(harness: Harness) {
    harness.orchestrator.stop();
    let result = timeout(RECV_TIMEOUT, harness.run)
        .await
        .expect("orchestrator did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_start_session_acks_then_reports_connected() {
    let mut harness = start_session().await;

    let command_id = start_shell(&mut harness.peer).await;

    match harness.peer.recv_payload().await {
        agent_message::Payload::Ack(ack) => {
            assert_eq!(ack.command_id, command_id);
            assert!(ack.success);
        }
        other => panic!("expected ack, got {}", other.kind()),
    }
    match harness.peer.recv_payload().await {
        agent_message::Payload::Status(status) => {
            assert_eq!(status.new_status, SessionStatus::Connected as i32);
            assert_eq!(status.old_status, SessionStatus::Unspecified as i32);
            assert!(status.working_directory.ends_with("tmp"));
        }
        other => panic!("expected status, got {}", other.kind()),
    }
    assert!(harness.orchestrator.is_pty_running());
    assert!(harness.orchestrator.is_connected());

    stop(harness).await;
}

#[tokio::test]
async fn test_input_produces_output() {
    let mut harness = start_session().await;
    start_shell(&mut harness.peer).await;
    harness.peer.recv_until(status_of).await;

    let input_id = harness
        .peer
        .send(server_command::Payload::Input(Input {
            data: b"echo hi\n".to_vec(),
        }))
        .await;

    let mut acked = false;
    let mut seen = Vec::new();
    while !(acked && String::from_utf8_lossy(&seen).contains("hi")) {
        match harness.peer.recv_payload().await {
            agent_message::Payload::Output(output) => seen.extend_from_slice(&output.data),
            agent_message::Payload::Ack(ack) => {
                assert_eq!(ack.command_id, input_id);
                acked = true;
            }
            _ => {}
        }
    }

    stop(harness).await;
}

#[tokio::test]
async fn test_out_of_band_kill_reports_exit_once() {
    let mut harness = start_session().await;
    let mut local = harness.orchestrator.subscribe();
    start_shell(&mut harness.peer).await;
    harness.peer.recv_until(status_of).await;

    let pid = harness.orchestrator.pty_pid().expect("shell has a pid");
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let disconnected = harness
        .peer
        .recv_until(|p| status_of(p).filter(|s| s.new_status == SessionStatus::Disconnected as i32))
        .await;
    assert!(disconnected.reason.starts_with("Exit code:"), "{}", disconnected.reason);

    // Nothing but heartbeats afterwards
    assert!(harness
        .peer
        .expect_silence(Duration::from_millis(300))
        .await
        .is_none());
    assert!(!harness.orchestrator.is_pty_running());

    let mut exits = 0;
    loop {
        match local.try_recv() {
            Ok(SessionEvent::Exit { .. }) => exits += 1,
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert_eq!(exits, 1);

    stop(harness).await;
}

#[tokio::test]
async fn test_start_session_twice_reuses_shell() {
    let mut harness = start_session().await;
    start_shell(&mut harness.peer).await;
    harness.peer.recv_until(status_of).await;
    let pid = harness.orchestrator.pty_pid();

    let second = start_shell(&mut harness.peer).await;
    let ack = harness
        .peer
        .recv_until(|p| match p {
            agent_message::Payload::Ack(ack) => Some(ack.clone()),
            _ => None,
        })
        .await;
    assert_eq!(ack.command_id, second);

    let status = harness.peer.recv_until(status_of).await;
    assert_eq!(status.new_status, SessionStatus::Connected as i32);
    assert_eq!(status.reason, "already running");
    assert_eq!(harness.orchestrator.pty_pid(), pid);

    stop(harness).await;
}

#[tokio::test]
async fn test_start_failure_is_reported_as_error() {
    let mut harness = start_session().await;

    let command_id = harness
        .peer
        .send(server_command::Payload::StartSession(StartSession {
            shell: "/nonexistent/shell".to_string(),
            working_directory: String::new(),
        }))
        .await;

    match harness.peer.recv_payload().await {
        agent_message::Payload::Ack(ack) => assert_eq!(ack.command_id, command_id),
        other => panic!("expected ack, got {}", other.kind()),
    }
    match harness.peer.recv_payload().await {
        agent_message::Payload::Error(error) => {
            assert_eq!(error.error_code, PTY_START_FAILED);
            assert!(error.message.contains("/nonexistent/shell"));
            assert!(!error.is_fatal);
        }
        other => panic!("expected error, got {}", other.kind()),
    }
    assert!(!harness.orchestrator.is_pty_running());
    assert!(harness.orchestrator.is_connected());

    stop(harness).await;
}

#[tokio::test]
async fn test_force_close_session() {
    let mut harness = start_session().await;
    start_shell(&mut harness.peer).await;
    harness.peer.recv_until(status_of).await;

    let command_id = harness
        .peer
        .send(server_command::Payload::CloseSession(CloseSession {
            reason: "user closed tab".to_string(),
            force: true,
        }))
        .await;

    let ack = harness
        .peer
        .recv_until(|p| match p {
            agent_message::Payload::Ack(ack) => Some(ack.clone()),
            _ => None,
        })
        .await;
    assert_eq!(ack.command_id, command_id);

    let status = harness.peer.recv_until(status_of).await;
    assert_eq!(status.new_status, SessionStatus::Disconnected as i32);
    assert_eq!(status.reason, "user closed tab");

    // The exit follows once the shell is reaped
    let exit = harness.peer.recv_until(status_of).await;
    assert!(exit.reason.starts_with("Exit code:"));

    stop(harness).await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let harness = start_session().await;
    let mut local = harness.orchestrator.subscribe();
    let orchestrator = Arc::clone(&harness.orchestrator);

    stop(harness).await;
    assert!(!orchestrator.is_running());
    assert!(!orchestrator.is_connected());

    let mut stopped = 0;
    while let Ok(event) = local.try_recv() {
        if matches!(event, SessionEvent::Status(ref s) if s == "stopped") {
            stopped += 1;
        }
    }
    assert_eq!(stopped, 1);

    orchestrator.stop();
    assert!(local.try_recv().is_err());
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let harness = start_session().await;

    assert!(matches!(
        harness.orchestrator.start().await,
        Err(OrchestratorError::AlreadyRunning)
    ));

    stop(harness).await;
}

#[tokio::test]
async fn test_background_job_output_does_not_follow_exit() {
    let mut harness = start_session().await;
    start_shell(&mut harness.peer).await;
    harness.peer.recv_until(status_of).await;

    let input_id = harness
        .peer
        .send(server_command::Payload::Input(Input {
            data: b"(trap '' HUP; sleep 1; echo LATE_MARKER) &\necho forked-$((2 + 2))\n".to_vec(),
        }))
        .await;
    let mut acked = false;
    let mut seen = Vec::new();
    while !(acked && String::from_utf8_lossy(&seen).contains("forked-4")) {
        match harness.peer.recv_payload().await {
            agent_message::Payload::Output(output) => seen.extend_from_slice(&output.data),
            agent_message::Payload::Ack(ack) => acked = ack.command_id == input_id,
            _ => {}
        }
    }

    let pid = harness.orchestrator.pty_pid().expect("shell has a pid");
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    harness
        .peer
        .recv_until(|p| status_of(p).filter(|s| s.new_status == SessionStatus::Disconnected as i32))
        .await;

    // The job prints well after the shell is gone
    let late = harness.peer.expect_silence(Duration::from_secs(2)).await;
    assert!(late.is_none(), "unexpected {:?}", late);

    stop(harness).await;
}

#[tokio::test]
async fn test_restart_during_shutdown_can_be_stopped() {
    let (connector, mut peers) = MemoryConnector::accepting();
    let orchestrator = Arc::new(SessionOrchestrator::new(
        SessionId::new("restart"),
        &test_config(),
        connector,
    ));
    let runner = Arc::clone(&orchestrator);
    let first = tokio::spawn(async move { runner.start().await });
    let mut peer = next_peer(&mut peers).await;
    peer.recv().await; // register

    orchestrator.stop();
    // Polled before the first run has had a chance to unwind
    let second = orchestrator.start();
    tokio::pin!(second);
    assert!(futures::poll!(&mut second).is_pending());
    assert!(orchestrator.is_running());

    let (second_result, ()) = tokio::join!(second, async {
        let first_result = timeout(RECV_TIMEOUT, first)
            .await
            .expect("first run did not stop")
            .unwrap();
        assert!(first_result.is_ok());
        assert!(orchestrator.is_running());

        let mut peer = next_peer(&mut peers).await;
        assert!(matches!(
            peer.recv().await.payload,
            Some(agent_message::Payload::Register(_))
        ));
        orchestrator.stop();
    });
    assert!(second_result.is_ok());
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_resize_command_is_applied_and_acked() {
    let mut harness = start_session().await;
    start_shell(&mut harness.peer).await;
    harness.peer.recv_until(status_of).await;

    let command_id = harness
        .peer
        .send(server_command::Payload::Resize(Resize {
            cols: 120,
            rows: 40,
        }))
        .await;
    assert_eq!(harness.peer.recv_until(ack_of).await, command_id);
    assert_eq!(harness.orchestrator.pty_size(), (120, 40));

    // A zero dimension is ignored but still acknowledged
    let ignored_id = harness
        .peer
        .send(server_command::Payload::Resize(Resize { cols: 0, rows: 10 }))
        .await;
    assert_eq!(harness.peer.recv_until(ack_of).await, ignored_id);
    assert_eq!(harness.orchestrator.pty_size(), (120, 40));

    stop(harness).await;
}

#[tokio::test]
async fn test_signal_command_is_acked_without_error() {
    let mut harness = start_session().await;
    start_shell(&mut harness.peer).await;
    harness.peer.recv_until(status_of).await;

    let command_id = harness
        .peer
        .send(server_command::Payload::Signal(Signal {
            signal: libc::SIGINT,
        }))
        .await;
    assert_eq!(harness.peer.recv_until(ack_of).await, command_id);

    while let Some(payload) = harness
        .peer
        .expect_silence(Duration::from_millis(300))
        .await
    {
        assert!(
            !matches!(payload, agent_message::Payload::Error(_)),
            "unexpected {:?}",
            payload
        );
    }
    assert!(harness.orchestrator.is_pty_running());

    stop(harness).await;
}
