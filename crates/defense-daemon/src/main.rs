use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use defense_core::paths::control_socket_path;
use defense_core::settings::DaemonSettings;
use defense_daemon::scanner::{ClamdProbe, ScannerProbe};
use defense_daemon::Daemon;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Endpoint protection daemon", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground
    Run(RunArgs),
    /// Ping the scanning engine once and report whether it answered
    CheckEngine {
        #[arg(long)]
        clamd_socket: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Control socket path
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Scanning engine socket path
    #[arg(long)]
    clamd_socket: Option<PathBuf>,
    /// Seconds between health checks
    #[arg(long)]
    health_interval: Option<u64>,
    /// Start with the firewall not required
    #[arg(long)]
    firewall_off: bool,
    /// Do not look for other engine evidence when its socket is missing
    #[arg(long)]
    no_fallback: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::CheckEngine { clamd_socket } => check_engine(clamd_socket).await,
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn settings_from(args: RunArgs) -> Result<DaemonSettings> {
    let socket = match args.socket {
        Some(path) => path,
        None => control_socket_path().context("resolve control socket path")?,
    };
    let mut settings = DaemonSettings::with_socket_path(socket);
    if let Some(path) = args.clamd_socket {
        settings.clamd_socket = path;
    }
    if let Some(secs) = args.health_interval {
        settings.health_interval_secs = secs;
    }
    if args.firewall_off {
        settings.firewall_enabled = false;
    }
    if args.no_fallback {
        settings.fallback_probing = false;
    }
    Ok(settings)
}

async fn run_command(args: RunArgs) -> Result<()> {
    let settings = settings_from(args)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    Daemon::new(settings).run(shutdown_rx).await
}

async fn check_engine(clamd_socket: Option<PathBuf>) -> Result<()> {
    let settings = DaemonSettings::with_socket_path(PathBuf::new());
    let socket = clamd_socket.unwrap_or(settings.clamd_socket.clone());
    let probe = ClamdProbe::new(socket.clone(), settings.probe_timeout());
    if probe.is_available().await {
        println!("engine reachable at {}", socket.display());
        Ok(())
    } else {
        anyhow::bail!("engine not reachable at {}", socket.display())
    }
}
