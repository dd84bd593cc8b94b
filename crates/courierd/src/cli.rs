//! `courierd` command line: start, stop and status.
//!
//! ```bash
//! # Start the daemon (foreground)
//! courierd start
//!
//! # Start the daemon in the background with a custom config
//! courierd start -d --config ~/courier.toml
//!
//! # Stop the daemon
//! courierd stop
//!
//! # Check daemon status
//! courierd status
//!
//! # Custom socket path and debug logging
//! COURIER_SOCKET=/run/courier.sock RUST_LOG=courierd=debug courierd start
//! ```
//!
//! SIGTERM and SIGINT trigger a graceful shutdown.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::CourierConfig;
use crate::server::{DaemonContext, DaemonServer};
use crate::transport::LoopbackTransport;
use crate::units::DirectoryStore;

/// courier daemon - session-aware unit dispatch
#[derive(Parser, Debug)]
#[command(name = "courierd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Configuration file (defaults to ~/.config/courier/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        /// Configuration file used to locate the socket
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("courier")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("courierd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("courierd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        // Stale PID file.
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

/// Entry point of the `courierd` binary.
pub fn run() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    });

    match command {
        Command::Start { daemon, config } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'courierd stop' to stop it first.");
                process::exit(1);
            }

            // Fail on a bad config before forking.
            let config = CourierConfig::load(config.as_deref()).context("Failed to load configuration")?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };

            println!("Stopping daemon (PID {pid})...");
            stop_daemon(pid)?;

            for _ in 0..50 {
                if !is_process_running(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }

            eprintln!("Daemon did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status { config } => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };

            println!("Daemon is running (PID {pid})");
            let config = CourierConfig::load(config.as_deref()).unwrap_or_default();
            if config.daemon.socket_path.exists() {
                println!("Socket: {}", config.daemon.socket_path.display());
            }
            Ok(())
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("courierd=info".parse()?)
                .add_directive("courier_core=info".parse()?)
                .add_directive("courier_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn run_daemon(config: CourierConfig) -> Result<()> {
    init_tracing()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "courier daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let store = Arc::new(DirectoryStore::new(&config.units.directory));
    let context = DaemonContext::start(
        &config,
        Arc::new(LoopbackTransport::new()),
        store,
        cancel_token.clone(),
    );
    info!("Session registry started");

    match context.units.reload().await {
        Ok(report) => info!(
            directory = %config.units.directory.display(),
            loaded = report.loaded,
            rejected = report.rejected,
            failed = report.failed,
            "Initial unit scan complete"
        ),
        Err(e) => warn!(
            directory = %config.units.directory.display(),
            error = %e,
            "Initial unit scan failed"
        ),
    }

    let supervisor = context.supervisor.clone();
    let socket_path: &Path = &config.daemon.socket_path;
    let server = DaemonServer::new(socket_path, context, cancel_token);

    info!(socket = %socket_path.display(), "Starting server");

    let result = server.run().await;
    supervisor.shutdown();

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("courier daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_the_default_command() {
        let args = Args::parse_from(["courierd"]);
        assert!(args.command.is_none());
    }

    #[test]
    fn test_start_flags() {
        let args = Args::parse_from(["courierd", "start", "-d", "--config", "/etc/courier.toml"]);
        match args.command {
            Some(Command::Start { daemon, config }) => {
                assert!(daemon);
                assert_eq!(config, Some(PathBuf::from("/etc/courier.toml")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_pid_file_lives_in_state_dir() {
        assert!(pid_file_path().ends_with("courier/courierd.pid"));
    }
}
