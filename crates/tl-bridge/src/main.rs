//! termlink bridge daemon
//!
//! Runs one bridged terminal session: connects to the remote peer, registers,
//! and spawns a shell when the peer asks for one. With `--attach` the shell is
//! also mirrored on the local terminal.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tl_bridge::host::{HostStartRequest, TerminalHost};
use tl_core::config::{self, BridgeConfig};

#[derive(Parser)]
#[command(name = "tl-bridge")]
#[command(about = "termlink bridge - streams a local shell to a remote peer")]
#[command(version)]
struct Args {
    /// Remote endpoint: http://host:port (gRPC) or tcp://host:port (framed TCP)
    #[arg(short, long, env = "TERMLINK_ENDPOINT")]
    endpoint: Option<String>,

    /// Session identifier (random UUID if not specified)
    #[arg(long)]
    session_id: Option<String>,

    /// Shell to spawn (defaults to $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Working directory for the shell (defaults to home)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Initial terminal width
    #[arg(long)]
    cols: Option<u16>,

    /// Initial terminal height
    #[arg(long)]
    rows: Option<u16>,

    /// Consecutive failed connection attempts before giving up
    #[arg(long)]
    max_retries: Option<u32>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Mirror the shell on this terminal: stdin goes to the PTY, output to stdout
    #[arg(long)]
    attach: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("termlink bridge starting...");

    let config = load_bridge_config(&args)?;
    tracing::info!("Remote endpoint: {}", config.endpoint);

    let host = TerminalHost::new(config);
    let mut status_rx = host.subscribe_status();
    let mut errors_rx = host.subscribe_errors();
    let mut exit_rx = host.subscribe_exit();
    let mut output_rx = host.subscribe_output();

    let request = HostStartRequest {
        session_id: args.session_id.clone(),
        shell: args.shell.clone(),
        working_directory: args.cwd.as_ref().map(|p| p.display().to_string()),
        cols: args.cols.unwrap_or(0),
        rows: args.rows.unwrap_or(0),
    };
    let response = host
        .start(request)
        .await
        .context("Failed to start bridge session")?;
    tracing::info!("Session {} started", response.session_id);

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    if args.attach {
        spawn_stdin_reader(stdin_tx);
    } else {
        drop(stdin_tx);
    }
    let mut stdout = tokio::io::stdout();

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break Ok(());
            }
            status = status_rx.recv() => match status {
                Ok(status) => {
                    tracing::info!("Status: {}", status);
                    if let Some(reason) = status.strip_prefix("failed: ") {
                        break Err(anyhow::anyhow!("Session failed: {}", reason));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
            error = errors_rx.recv() => {
                if let Ok(error) = error {
                    tracing::warn!("Session error: {}", error);
                }
            }
            exit = exit_rx.recv() => {
                if let Ok(exit) = exit {
                    tracing::info!("Shell exited with code {} (signal {:?})", exit.code, exit.signal);
                }
            }
            output = output_rx.recv(), if args.attach => {
                if let Ok(data) = output {
                    stdout.write_all(&data).await.context("Failed to write to stdout")?;
                    stdout.flush().await.context("Failed to flush stdout")?;
                }
            }
            Some(input) = stdin_rx.recv() => {
                if let Err(e) = host.write_input(&input) {
                    tracing::warn!("Dropping local input: {}", e);
                }
            }
        }
    };

    host.stop().await;
    tracing::info!("termlink bridge stopped");
    outcome
}

/// Config file, then command-line overrides
fn load_bridge_config(args: &Args) -> Result<BridgeConfig> {
    let mut config: BridgeConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let path = config::default_config_path();
            if path.exists() {
                config::load_config(&path).unwrap_or_else(|e| {
                    tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    BridgeConfig::default()
                })
            } else {
                BridgeConfig::default()
            }
        }
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(max_retries) = args.max_retries {
        config.transport.max_retries = Some(max_retries);
    }
    Ok(config)
}

/// Forward local stdin to the session from a blocking thread
fn spawn_stdin_reader(tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
}
