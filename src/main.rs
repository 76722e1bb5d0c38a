mod audit;
mod auth;
mod cli;
mod config;
mod error;
mod notify;
mod offload;
mod router;
mod scanner;
mod supervisor;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "warden", about = "Access-gated, time-bounded probe sessions")]
pub struct Args {
    #[arg(long, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "WARDEN_ACCESS_FILE", help = "Access file (overrides config)")]
    pub access_file: Option<PathBuf>,

    #[arg(long = "admin", value_name = "USER_ID", action = clap::ArgAction::Append, help = "Grant admin rights to a user id")]
    pub admins: Vec<i64>,

    #[arg(long, value_name = "USER_ID", help = "Identity to act as")]
    pub user: Option<i64>,

    #[arg(short, long, help = "Run one command and exit (requires --user)")]
    pub command: Option<String>,

    #[arg(long, env = "WARDEN_LOG_FILE", help = "Write logs to this file instead of stderr")]
    pub log_file: Option<PathBuf>,

    #[arg(long, help = "Audit journal path (overrides config)")]
    pub audit_log: Option<PathBuf>,

    #[arg(long, help = "Debug-level logging")]
    pub verbose: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let default_level = if args.verbose { "warden=debug" } else { "warden=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    }
    .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args)?;

    let mut cfg = if let Some(config_path) = &args.config {
        config::Config::load_from(config_path)?
    } else {
        config::Config::load().unwrap_or_else(|e| {
            warn!("Ignoring unreadable config: {}", e);
            config::Config::default()
        })
    };

    // Apply CLI overrides
    if let Some(path) = &args.access_file {
        cfg.auth.file = path.clone();
    }
    for admin in &args.admins {
        if !cfg.admins.contains(admin) {
            cfg.admins.push(*admin);
        }
    }
    if let Some(path) = &args.audit_log {
        cfg.audit.path = Some(path.clone());
    }

    if let Err(errors) = cfg.validate() {
        let lines: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(anyhow!("Invalid configuration:\n  {}", lines.join("\n  ")));
    }
    if cfg.admins.is_empty() {
        warn!("No admins configured; access requests cannot be approved");
    }

    let offset = cfg
        .auth
        .offset()
        .ok_or_else(|| anyhow!("Invalid auth.utc_offset_minutes"))?;
    let store = Arc::new(
        auth::AuthStore::load(&cfg.auth.file, offset, Arc::new(auth::SystemClock))
            .with_context(|| format!("Failed to load {}", cfg.auth.file.display()))?,
    );

    let notifier: Arc<dyn notify::Notifier> = Arc::new(notify::ConsoleNotifier);
    let supervisor = Arc::new(supervisor::Supervisor::new(&cfg.probe, notifier.clone())?);
    let offload = offload::OffloadClient::from_config(&cfg.offload)?
        .map(|client| Arc::new(client) as Arc<dyn offload::OffloadService>);

    let run_id = uuid::Uuid::new_v4().to_string();
    let audit = Arc::new(match &cfg.audit.path {
        Some(path) => audit::AuditLog::open(path, &run_id)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?,
        None => audit::AuditLog::disabled(),
    });

    let scanner = scanner::ExpiryScanner::new(
        store.clone(),
        notifier.clone(),
        cfg.auth.sweep_interval(),
    );
    scanner.sweep_once();
    let _scanner = scanner.spawn()?;

    info!(
        run_id = %run_id,
        access_file = %cfg.auth.file.display(),
        offload = offload.is_some(),
        "warden started"
    );

    let router = router::Router::new(
        cfg.admins.clone(),
        store,
        supervisor.clone(),
        offload,
        notifier,
        audit,
    );
    let ctx = cli::Context {
        router,
        current_user: Cell::new(args.user),
    };

    let result = match (&args.command, args.user) {
        (Some(command), Some(user)) => cli::run_once(&ctx, user, command),
        (Some(_), None) => Err(anyhow!("--command requires --user")),
        (None, _) => cli::run_repl(&ctx),
    };

    // Leave no probe running past the process
    let running = supervisor.active_count();
    if running > 0 {
        info!(running, "stopping sessions on shutdown");
    }
    if let supervisor::StopOutcome::Stopped(count) = supervisor.stop_all() {
        info!(count, "stopped sessions on shutdown");
    }

    result
}
