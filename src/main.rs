#![forbid(unsafe_code)]

//! `tunnel-warden`: launch and supervise Session Manager tunnels.
//!
//! Every subcommand prints JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tunnel_warden::command::Platform;
use tunnel_warden::config::GlobalConfig;
use tunnel_warden::deps::check_dependencies;
use tunnel_warden::models::connection::{ConnectionMethod, SessionContext};
use tunnel_warden::models::target::Target;
use tunnel_warden::orchestrator::reconcile_monitor::spawn_reconcile_monitor;
use tunnel_warden::orchestrator::spawner::OsLauncher;
use tunnel_warden::orchestrator::supervisor::{LaunchRequest, Supervisor};
use tunnel_warden::persistence::connection_registry::ConnectionRegistry;
use tunnel_warden::persistence::db;
use tunnel_warden::persistence::kv_store::KvStore;
use tunnel_warden::process::SystemProcessTable;
use tunnel_warden::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tunnel-warden", about = "Session Manager tunnel supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to `config.toml` in the data directory; a missing file
    /// means built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

/// Target and credential context shared by the launch subcommands.
#[derive(Debug, Args)]
struct TargetArgs {
    /// Target resource id, e.g. `i-0123456789abcdef0`.
    target: String,

    /// Display name, also the key for sticky ports.
    #[arg(long)]
    name: Option<String>,

    /// Credential profile.
    #[arg(long)]
    profile: String,

    /// Region code.
    #[arg(long)]
    region: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open an interactive shell in a new console window.
    Shell(TargetArgs),

    /// Forward a local port to the target's RDP port.
    Rdp {
        #[command(flatten)]
        target: TargetArgs,
        /// Remote RDP port.
        #[arg(long)]
        remote_port: Option<u16>,
        /// Open a desktop RDP client once the forward is up.
        #[arg(long)]
        open: bool,
    },

    /// Forward a local port to a port on the target or behind it.
    Forward {
        #[command(flatten)]
        target: TargetArgs,
        /// Remote port.
        #[arg(long)]
        remote_port: u16,
        /// Host reachable from the target; forwards through the target.
        #[arg(long)]
        remote_host: Option<String>,
    },

    /// Reconcile and list active connections.
    List,

    /// Terminate a connection and its process tree.
    Terminate {
        /// Connection id.
        id: String,
    },

    /// Keep the registry reconciled until interrupted.
    Watch,

    /// Report installed launcher and plugin versions.
    Doctor,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(code = err.code(), %err, "command failed");
            let body = ErrorBody {
                error: err.code(),
                message: err.to_string(),
            };
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&body).unwrap_or_else(|_| err.to_string())
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let config_path = args
        .config
        .unwrap_or_else(|| GlobalConfig::default().data_dir.join("config.toml"));
    let config = Arc::new(GlobalConfig::load_or_default(&config_path)?);
    info!(path = %config_path.display(), "configuration loaded");

    if matches!(args.command, Command::Doctor) {
        let report = check_dependencies(&config.launcher.executable).await;
        return print_json(&report);
    }

    let db = Arc::new(db::connect(config.db_path()).await?);
    let registry = ConnectionRegistry::new(KvStore::new(db));
    let supervisor = Supervisor::new(
        Arc::clone(&config),
        registry,
        Arc::new(SystemProcessTable::new()),
        Arc::new(OsLauncher),
        Platform::current(),
    );

    match args.command {
        Command::Shell(target) => {
            let request = launch_request(ConnectionMethod::InteractiveShell, target, None, None)?;
            print_json(&supervisor.launch(request).await?)
        }
        Command::Rdp {
            target,
            remote_port,
            open,
        } => {
            let request =
                launch_request(ConnectionMethod::RdpForward, target, remote_port, None)?;
            let connection = supervisor.launch(request).await?;
            if open {
                if let Err(err) = supervisor.open_rdp_client(&connection) {
                    warn!(connection_id = %connection.connection_id, %err, "failed to open rdp client");
                }
            }
            print_json(&connection)
        }
        Command::Forward {
            target,
            remote_port,
            remote_host,
        } => {
            let method = if remote_host.is_some() {
                ConnectionMethod::RemoteHostPortForward
            } else {
                ConnectionMethod::LocalPortForward
            };
            let request = launch_request(method, target, Some(remote_port), remote_host)?;
            print_json(&supervisor.launch(request).await?)
        }
        Command::List => print_json(&supervisor.list_active().await?),
        Command::Terminate { id } => print_json(&supervisor.terminate(&id).await?),
        Command::Watch => watch(supervisor, &config).await,
        Command::Doctor => Ok(()),
    }
}

fn launch_request(
    method: ConnectionMethod,
    args: TargetArgs,
    remote_port: Option<u16>,
    remote_host: Option<String>,
) -> Result<LaunchRequest> {
    Ok(LaunchRequest {
        method,
        target: Target::new(args.target, args.name)?,
        context: SessionContext::new(args.profile, args.region),
        remote_port,
        remote_host,
    })
}

async fn watch(supervisor: Supervisor, config: &GlobalConfig) -> Result<()> {
    let initial = supervisor.reconcile().await;
    info!(
        pruned = initial.pruned.len(),
        adopted = initial.adopted.len(),
        "initial reconcile complete"
    );

    let ct = CancellationToken::new();
    let interval = std::time::Duration::from_secs(config.reconcile.interval_seconds.max(1));
    let monitor = spawn_reconcile_monitor(supervisor.clone(), interval, ct.clone());
    info!(interval_seconds = interval.as_secs(), "watching connections");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();
    if let Err(err) = monitor.await {
        error!(%err, "reconcile monitor task failed");
    }

    print_json(&supervisor.registry().get_all().await?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
