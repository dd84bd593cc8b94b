//! `courier` command line.
//!
//! ```bash
//! courier sessions                        # list sessions
//! courier open "+62 812-3456"             # start pairing a new account
//! courier dispatch 628123 628999 ping -n 5
//! courier units save greet ./greet.toml   # write, then reload
//! courier log --since 42                  # activity after seq 42
//! courier watch                           # stream session updates
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier_core::{
    ActivityEntry, DispatchOutcome, DispatchRequest, IterationSpec, ManifestReport, SessionId,
    SessionView, UnitSummary,
};
use courier_protocol::{DaemonMessage, MessageType};
use tracing_subscriber::EnvFilter;

use crate::client::{ClientConfig, ControlClient};

/// courier - control client for the courier daemon
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
struct Args {
    /// Daemon socket (defaults to $COURIER_SOCKET, then /tmp/courier.sock)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sessions and their connection state
    Sessions,
    /// Open a session for a phone number, pairing it if needed
    Open { phone_number: String },
    /// Log a session out and forget its credentials
    Logout { session_id: String },
    /// Run a unit against a target
    Dispatch {
        session_id: String,
        target: String,
        unit: String,
        /// Iteration count; free text is accepted and coerced by the daemon
        #[arg(short = 'n', long)]
        iterations: Option<String>,
    },
    /// Manage the unit registry
    #[command(subcommand)]
    Units(UnitsCommand),
    /// Show recent activity
    Log {
        /// Only entries after this sequence number
        #[arg(long)]
        since: Option<u64>,
    },
    /// Stream session updates until interrupted
    Watch,
    /// Check that the daemon answers
    Ping,
}

#[derive(Subcommand, Debug)]
enum UnitsCommand {
    /// List loaded units
    List,
    /// Rescan the unit store
    Reload,
    /// Print a stored manifest
    Show { name: String },
    /// Store a manifest file under NAME and reload
    Save { name: String, file: PathBuf },
    /// Delete a stored manifest and reload
    Delete { name: String },
    /// Check a manifest file without loading it
    Verify { file: PathBuf },
    /// Register an in-memory unit from a manifest file
    Transient { name: String, file: PathBuf },
    /// Drop an in-memory unit
    Untransient { name: String },
}

/// Entry point for the `courier` binary.
pub fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(execute(args))
}

async fn execute(args: Args) -> Result<()> {
    let config = ClientConfig::resolve(args.socket);
    let mut client = ControlClient::connect(&config).await?;

    if let Command::Watch = args.command {
        return watch(client).await;
    }

    let request = build_request(args.command)?;
    let reply = client.request(request).await?;
    println!("{}", render(&reply));

    if let DaemonMessage::DispatchResult { outcome } = &reply {
        if !outcome.success {
            client.disconnect().await?;
            bail!("dispatch failed");
        }
    }

    client.disconnect().await?;
    Ok(())
}

/// Translates a one-shot command into its protocol request.
fn build_request(command: Command) -> Result<MessageType> {
    let request = match command {
        Command::Sessions => MessageType::ListSessions,
        Command::Open { phone_number } => MessageType::OpenSession { phone_number },
        Command::Logout { session_id } => MessageType::Logout {
            session_id: SessionId::new(session_id),
        },
        Command::Dispatch {
            session_id,
            target,
            unit,
            iterations,
        } => MessageType::Dispatch {
            request: DispatchRequest::new(
                SessionId::new(session_id),
                target,
                unit,
                iterations.as_deref().map(parse_iterations),
            ),
        },
        Command::Units(units) => match units {
            UnitsCommand::List => MessageType::ListUnits,
            UnitsCommand::Reload => MessageType::ReloadUnits,
            UnitsCommand::Show { name } => MessageType::ReadUnit { name },
            UnitsCommand::Save { name, file } => MessageType::SaveUnit {
                name,
                content: read_manifest(&file)?,
            },
            UnitsCommand::Delete { name } => MessageType::DeleteUnit { name },
            UnitsCommand::Verify { file } => MessageType::VerifyUnit {
                content: read_manifest(&file)?,
            },
            UnitsCommand::Transient { name, file } => MessageType::RegisterTransient {
                name,
                content: read_manifest(&file)?,
            },
            UnitsCommand::Untransient { name } => MessageType::RemoveTransient { name },
        },
        Command::Log { since } => MessageType::Activity { since },
        Command::Ping => MessageType::Ping { seq: 1 },
        Command::Watch => bail!("watch is a streaming command"),
    };
    Ok(request)
}

/// Keeps numbers numeric on the wire; anything else goes as text.
fn parse_iterations(raw: &str) -> IterationSpec {
    let trimmed = raw.trim();
    if let Ok(count) = trimmed.parse::<i64>() {
        IterationSpec::Count(count)
    } else if let Ok(value) = trimmed.parse::<f64>() {
        IterationSpec::Decimal(value)
    } else {
        IterationSpec::Text(raw.to_string())
    }
}

fn read_manifest(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn watch(mut client: ControlClient) -> Result<()> {
    match client.request(MessageType::Subscribe).await? {
        DaemonMessage::SessionList { sessions } => println!("{}", render_sessions(&sessions)),
        other => bail!("unexpected reply to subscribe: {other:?}"),
    }

    loop {
        tokio::select! {
            message = client.next_message() => {
                println!("{}", render(&message?));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await?;
    Ok(())
}

// ============================================================================
// Rendering
// ============================================================================

fn render(message: &DaemonMessage) -> String {
    match message {
        DaemonMessage::SessionList { sessions } => render_sessions(sessions),
        DaemonMessage::SessionUpdated { session } => render_session(session),
        DaemonMessage::SessionRemoved { session_id, reason } => {
            format!("{session_id}  removed ({reason})")
        }
        DaemonMessage::Ack { message } => message.clone(),
        DaemonMessage::DispatchResult { outcome } => render_outcome(outcome),
        DaemonMessage::UnitList { units } => render_units(units),
        DaemonMessage::UnitSource { content, .. } => content.clone(),
        DaemonMessage::ReloadComplete {
            loaded,
            rejected,
            failed,
        } => format!("reloaded: {loaded} loaded, {rejected} rejected, {failed} failed"),
        DaemonMessage::VerifyReport { report } => render_report(report),
        DaemonMessage::TransientRegistered {
            name,
            integrity_tag,
        } => format!("transient unit {name} registered ({integrity_tag})"),
        DaemonMessage::Activity { entries, next_seq } => render_activity(entries, *next_seq),
        DaemonMessage::Pong { seq } => format!("pong {seq}"),
        other => format!("{other:?}"),
    }
}

fn render_session(session: &SessionView) -> String {
    let mut line = format!("{:<16} {:<12}", session.id.as_str(), session.state.label());
    if let Some(code) = &session.pairing_code {
        line.push_str(&format!(" pairing code {code}"));
    }
    if let Some(identity) = &session.identity {
        line.push_str(&format!(" as {identity}"));
    }
    if session.reconnect_attempts > 0 {
        line.push_str(&format!(" (attempt {})", session.reconnect_attempts));
    }
    if let Some(error) = &session.last_error {
        line.push_str(&format!(" [{error}]"));
    }
    line
}

fn render_sessions(sessions: &[SessionView]) -> String {
    if sessions.is_empty() {
        return "no sessions".to_string();
    }
    sessions
        .iter()
        .map(render_session)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_outcome(outcome: &DispatchOutcome) -> String {
    let target = outcome
        .target
        .as_ref()
        .map_or_else(|| "-".to_string(), ToString::to_string);
    match &outcome.error {
        None => format!(
            "dispatched to {target}: {} completed, {} failed",
            outcome.completed, outcome.failed
        ),
        Some(error) => format!(
            "dispatch to {target} failed: {error} ({} completed, {} failed)",
            outcome.completed, outcome.failed
        ),
    }
}

fn render_units(units: &[UnitSummary]) -> String {
    if units.is_empty() {
        return "no units loaded".to_string();
    }
    units
        .iter()
        .map(|u| {
            format!(
                "{:<20} {:<10} {:<10} {:<12} {}",
                u.name, u.version, u.origin, u.executor, u.integrity_tag
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_report(report: &ManifestReport) -> String {
    let check = |ok: bool| if ok { "ok" } else { "missing" };
    let mut lines = vec![
        format!("parsed:        {}", if report.parsed { "ok" } else { "failed" }),
        format!("version:       {}", check(report.has_version)),
        format!("integrity_tag: {}", check(report.has_integrity_tag)),
        format!("executor:      {}", check(report.has_executor)),
    ];
    if report.has_executor && !report.executor_known {
        lines.push("executor is not in the catalog".to_string());
    }
    lines.push(if report.is_compliant() {
        "compliant".to_string()
    } else {
        "not compliant".to_string()
    });
    lines.join("\n")
}

fn render_activity(entries: &[ActivityEntry], next_seq: u64) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .map(|e| {
            format!(
                "{:>6} {} {:?} [{}] {}",
                e.seq,
                e.at.with_timezone(&chrono::Local).format("%H:%M:%S"),
                e.level,
                e.source,
                e.message
            )
        })
        .collect();
    lines.push(format!("next: --since {next_seq}"));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ConnectionState, DispatchError, Target};

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_dispatch_args() {
        let args = parse(&["courier", "dispatch", "628123", "628999", "ping", "-n", "5"]);
        let request = build_request(args.command).unwrap();
        let MessageType::Dispatch { request } = request else {
            panic!("expected dispatch");
        };
        assert_eq!(request.session_id.as_str(), "628123");
        assert_eq!(request.target, "628999");
        assert_eq!(request.unit, "ping");
        assert_eq!(request.iterations, Some(IterationSpec::Count(5)));
    }

    #[test]
    fn test_iterations_keep_their_shape() {
        assert_eq!(parse_iterations("3"), IterationSpec::Count(3));
        assert_eq!(parse_iterations("-2"), IterationSpec::Count(-2));
        assert_eq!(parse_iterations("2.5"), IterationSpec::Decimal(2.5));
        assert_eq!(parse_iterations("abc"), IterationSpec::Text("abc".to_string()));
    }

    #[test]
    fn test_global_socket_flag() {
        let args = parse(&["courier", "sessions", "--socket", "/run/c.sock"]);
        assert_eq!(args.socket, Some(PathBuf::from("/run/c.sock")));
        assert!(matches!(args.command, Command::Sessions));
    }

    #[test]
    fn test_units_subcommands() {
        let args = parse(&["courier", "units", "delete", "greet"]);
        let request = build_request(args.command).unwrap();
        assert!(matches!(request, MessageType::DeleteUnit { name } if name == "greet"));

        let args = parse(&["courier", "units", "save", "greet", "/nonexistent/greet.toml"]);
        assert!(build_request(args.command).is_err(), "missing file is reported");
    }

    #[test]
    fn test_watch_is_not_a_request() {
        let args = parse(&["courier", "watch"]);
        assert!(build_request(args.command).is_err());
    }

    #[test]
    fn test_render_session_with_pairing_code() {
        let session = SessionView {
            id: SessionId::new("628123"),
            state: ConnectionState::Connecting,
            pairing_code: Some("ABCD-1234".to_string()),
            last_error: None,
            identity: None,
            reconnect_attempts: 0,
            updated_at: chrono::Utc::now(),
        };
        let line = render_session(&session);
        assert!(line.starts_with("628123"));
        assert!(line.contains("pairing code ABCD-1234"));
    }

    #[test]
    fn test_render_failed_outcome() {
        let outcome = DispatchOutcome::aborted(
            Target::new("628999@s.direct"),
            DispatchError::session_death("closed"),
            2,
            1,
        );
        let text = render_outcome(&outcome);
        assert!(text.contains("628999@s.direct"));
        assert!(text.contains("session died: closed"));
        assert!(text.contains("2 completed, 1 failed"));
    }
}
