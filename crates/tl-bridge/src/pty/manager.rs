//! PTY process management
//!
//! Owns at most one shell process attached to a pseudo-terminal, using the
//! portable-pty crate. Output, exit and runtime faults are reported as
//! [`PtyEvent`]s on a channel rather than through stored callbacks.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tl_core::config::PtyConfig;

use super::shell::validate_shell;
use super::PtyError;

/// Channel capacity for events from the PTY.
///
/// The reader thread blocks when the buffer is full, which throttles a
/// chatty shell instead of dropping output.
pub const PTY_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Buffer size for reading from the PTY
const READ_BUFFER_SIZE: usize = 4096;

/// How long the exit watcher waits for the reader to drain before reporting
/// the exit anyway (a grandchild may keep the terminal open).
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[cfg(unix)]
pub const SIGKILL: i32 = libc::SIGKILL;
#[cfg(unix)]
pub const SIGTERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
pub const SIGKILL: i32 = 9;
#[cfg(not(unix))]
pub const SIGTERM: i32 = 15;

/// Events emitted by the process manager
#[derive(Debug)]
pub enum PtyEvent {
    /// A chunk of terminal output (stdout and stderr are merged by the PTY)
    Data(Bytes),
    /// The shell exited. Sent exactly once per spawned process.
    Exit {
        code: i32,
        /// Signal delivered by this manager that ended the process, if any
        signal: Option<i32>,
    },
    /// A non-fatal runtime fault; the shell keeps running
    Error(PtyError),
}

/// Per-start overrides; unset fields fall back to [`PtyConfig`]
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub shell: Option<String>,
    pub working_directory: Option<String>,
    pub env: Vec<(String, String)>,
}

/// Manages the single PTY session of one bridge
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: PtyConfig,
    state: Mutex<ManagerState>,
    events: mpsc::Sender<PtyEvent>,
}

struct ManagerState {
    handle: Option<PtyHandle>,
    /// Last known terminal size, reused by the next spawn
    cols: u16,
    rows: u16,
    /// Bumped on every spawn so a stale exit watcher cannot clear a newer handle
    generation: u64,
    /// Directory of the most recent spawn
    working_directory: Option<PathBuf>,
}

/// The live PTY and the handles needed to drive it
struct PtyHandle {
    generation: u64,
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Signal sent by `kill`, reported with the exit
    kill_signal: Option<i32>,
}

impl ProcessManager {
    /// Create a manager and the receiver for its events
    pub fn new(config: PtyConfig) -> (Self, mpsc::Receiver<PtyEvent>) {
        let (events, events_rx) = mpsc::channel(PTY_EVENT_CHANNEL_CAPACITY);
        let state = ManagerState {
            handle: None,
            cols: config.cols,
            rows: config.rows,
            generation: 0,
            working_directory: None,
        };

        let manager = Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                events,
            }),
        };
        (manager, events_rx)
    }

    /// Spawn the shell. Fails if one is already running.
    ///
    /// Must be called from within a Tokio runtime: the reader and exit
    /// watcher run as blocking tasks.
    pub fn start(&self, options: SpawnOptions) -> Result<u32, PtyError> {
        let mut state = self.inner.lock_state();
        if state.handle.is_some() {
            return Err(PtyError::AlreadyRunning);
        }

        let config = &self.inner.config;
        let shell = config.resolved_shell(options.shell.as_deref());
        validate_shell(&shell)?;

        let working_directory =
            config.resolved_working_directory(options.working_directory.as_deref());
        if !working_directory.is_dir() {
            return Err(PtyError::WorkingDirectory(working_directory));
        }

        tracing::info!(
            "Starting PTY: shell={} cwd={:?} size={}x{}",
            shell,
            working_directory,
            state.cols,
            state.rows
        );

        let pty_pair = native_pty_system()
            .openpty(PtySize {
                rows: state.rows,
                cols: state.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&working_directory);
        for (key, value) in config.env.iter().chain(options.env.iter()) {
            cmd.env(key, value);
        }
        // Nested programs that sniff for a terminal should still colorize
        cmd.env("TERM", &config.term);
        cmd.env("COLORTERM", "truecolor");
        cmd.env("FORCE_COLOR", "1");

        let mut child = pty_pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(format!("Failed to spawn shell {}: {}", shell, e)))?;
        // Only the child may hold the slave, otherwise the reader never sees EOF
        drop(pty_pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let spawned = pty_pair.master.try_clone_reader().and_then(|reader| {
            let writer = pty_pair.master.take_writer()?;
            Ok((reader, writer))
        });
        let (reader, writer) = match spawned {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                return Err(PtyError::Spawn(format!("Failed to attach to PTY: {}", e)));
            }
        };

        state.generation += 1;
        let generation = state.generation;
        state.working_directory = Some(working_directory);
        state.handle = Some(PtyHandle {
            generation,
            pid,
            master: pty_pair.master,
            writer,
            killer,
            kill_signal: None,
        });
        drop(state);

        tracing::info!("Spawned shell process with PID: {:?}", pid);

        let gate = OutputGate::new();
        let reader_task = spawn_pty_reader(reader, self.inner.events.clone(), gate.clone());
        let waiter = tokio::task::spawn_blocking(move || child.wait());
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = match waiter.await {
                Ok(status) => status,
                Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
            };
            // Deliver all output before the exit so nothing trails it
            let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader_task).await;
            // A background job may still hold the terminal open
            gate.close().await;
            inner.finish(generation, status).await;
        });

        Ok(pid.unwrap_or(0))
    }

    /// Write raw bytes to the shell's input.
    ///
    /// A no-op (with a warning) when no shell is running.
    pub fn write(&self, data: &[u8]) {
        let mut state = self.inner.lock_state();
        let Some(handle) = state.handle.as_mut() else {
            tracing::warn!("Dropping {} bytes of input: no PTY running", data.len());
            return;
        };

        let result = handle
            .writer
            .write_all(data)
            .and_then(|_| handle.writer.flush());
        drop(state);

        if let Err(e) = result {
            self.inner.emit_error(PtyError::Io(e));
        }
    }

    /// Resize the live PTY and remember the size for later spawns.
    ///
    /// A no-op when no shell is running.
    pub fn resize(&self, cols: u16, rows: u16) {
        let mut state = self.inner.lock_state();
        let Some(handle) = state.handle.as_ref() else {
            tracing::debug!("Ignoring resize to {}x{}: no PTY running", cols, rows);
            return;
        };

        tracing::debug!("Resizing PTY to {}x{}", cols, rows);
        let result = handle.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });

        match result {
            Ok(()) => {
                state.cols = cols;
                state.rows = rows;
            }
            Err(e) => {
                drop(state);
                self.inner
                    .emit_error(PtyError::Resize(format!("{}x{}: {}", cols, rows, e)));
            }
        }
    }

    /// Deliver a signal straight to the shell's process id
    pub fn signal(&self, signal: i32) {
        let Some(pid) = self.pid() else {
            tracing::warn!("Ignoring signal {}: no PTY running", signal);
            return;
        };

        tracing::debug!("Sending signal {} to PID {}", signal, pid);
        if let Err(e) = send_signal(pid, signal) {
            self.inner.emit_error(e);
        }
    }

    /// Ask the shell to terminate. The exit arrives later as [`PtyEvent::Exit`].
    pub fn kill(&self, signal: i32) {
        let mut state = self.inner.lock_state();
        let Some(handle) = state.handle.as_mut() else {
            tracing::debug!("Ignoring kill: no PTY running");
            return;
        };

        tracing::info!("Killing PTY process {:?} with signal {}", handle.pid, signal);
        handle.kill_signal = Some(signal);
        let result = match handle.pid {
            Some(pid) => send_signal(pid, signal),
            None => handle.killer.kill().map_err(PtyError::Io),
        };
        drop(state);

        if let Err(e) = result {
            self.inner.emit_error(e);
        }
    }

    /// Hard-stop: SIGKILL the shell if running, then release every handle.
    ///
    /// Idempotent. No exit event is emitted for a destroyed process.
    pub fn destroy(&self) {
        let handle = self.inner.lock_state().handle.take();
        let Some(mut handle) = handle else {
            return;
        };

        tracing::info!("Destroying PTY process {:?}", handle.pid);
        let result = match handle.pid {
            Some(pid) => send_signal(pid, SIGKILL),
            None => handle.killer.kill().map_err(PtyError::Io),
        };
        if let Err(e) = result {
            tracing::debug!("Kill during destroy failed: {}", e);
        }
    }

    /// Whether a shell is currently running
    pub fn is_running(&self) -> bool {
        self.inner.lock_state().handle.is_some()
    }

    /// Process ID of the running shell
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock_state().handle.as_ref().and_then(|h| h.pid)
    }

    /// Remembered terminal size as `(cols, rows)`
    pub fn size(&self) -> (u16, u16) {
        let state = self.inner.lock_state();
        (state.cols, state.rows)
    }

    /// Working directory of the most recent spawn
    pub fn working_directory(&self) -> Option<PathBuf> {
        self.inner.lock_state().working_directory.clone()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_error(&self, error: PtyError) {
        tracing::warn!("PTY error: {}", error);
        if self.events.try_send(PtyEvent::Error(error)).is_err() {
            tracing::warn!("PTY event channel full or closed; error dropped");
        }
    }

    /// Clean up after the shell exits and report it once
    async fn finish(&self, generation: u64, status: std::io::Result<portable_pty::ExitStatus>) {
        let signal = {
            let mut state = self.lock_state();
            match state.handle.as_ref() {
                Some(handle) if handle.generation == generation => {
                    let signal = handle.kill_signal;
                    state.handle = None;
                    signal
                }
                // Destroyed or replaced; its listeners are gone
                _ => return,
            }
        };

        let code = match status {
            Ok(status) => status.exit_code() as i32,
            Err(e) => {
                tracing::warn!("Failed to wait for shell: {}", e);
                -1
            }
        };
        tracing::info!("Shell exited with code {} (signal {:?})", code, signal);

        if self.events.send(PtyEvent::Exit { code, signal }).await.is_err() {
            tracing::debug!("PTY event channel closed before exit was reported");
        }
    }
}

/// Lets the reader forward output only until the exit is reported.
///
/// The reader holds the lock across each send, so once `close` returns no
/// further `Data` from that process can enter the channel.
#[derive(Clone)]
struct OutputGate(Arc<tokio::sync::Mutex<bool>>);

impl OutputGate {
    fn new() -> Self {
        Self(Arc::new(tokio::sync::Mutex::new(true)))
    }

    async fn close(&self) {
        *self.0.lock().await = false;
    }
}

/// Spawn a blocking task that forwards PTY output until EOF or the gate closes
fn spawn_pty_reader(
    mut reader: Box<dyn Read + Send>,
    events: mpsc::Sender<PtyEvent>,
    gate: OutputGate,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    let open = gate.0.blocking_lock();
                    if !*open {
                        tracing::debug!("Dropping {} bytes read after exit", n);
                        break;
                    }
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if events.blocking_send(PtyEvent::Data(data)).is_err() {
                        tracing::debug!("PTY event channel closed");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is how Linux reports that the slave side closed
                    tracing::debug!("PTY reader closed: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<(), PtyError> {
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(PtyError::Signal {
            signal,
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: i32) -> Result<(), PtyError> {
    Err(PtyError::Signal {
        signal,
        pid,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are not supported on this platform",
        ),
    })
}
