use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::{fmt::Debug, path::PathBuf};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use library_orchestrator::background_jobs::jobs::build_registry;
use library_orchestrator::background_jobs::{LoggingObserver, Orchestrator};
use library_orchestrator::config;
use library_orchestrator::execution_log::SqliteExecutionLog;
use library_orchestrator::server::{metrics, run_server, RequestsLoggingLevel, ServerConfig};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the execution log database (jobs.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Seconds between scheduler ticks.
    #[clap(long, default_value_t = 30)]
    pub tick_interval_secs: u64,

    /// Number of workers executing queued jobs.
    #[clap(long, default_value_t = 1)]
    pub worker_count: usize,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            metrics_port: args.metrics_port,
            logging_level: args.logging_level.clone(),
            tick_interval_secs: args.tick_interval_secs,
            worker_count: args.worker_count,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  port: {}", app_config.port);
    info!(
        "  scheduler: tick every {}s, {} worker(s)",
        app_config.scheduler.tick_interval_secs, app_config.scheduler.worker_count
    );

    info!("Initializing metrics...");
    metrics::init_metrics();

    if !app_config.execution_log_path().exists() {
        info!(
            "Creating new execution log at {:?}",
            app_config.execution_log_path()
        );
    }
    let execution_log = Arc::new(SqliteExecutionLog::new(app_config.execution_log_path())?);

    let registry = build_registry(&app_config)?;
    info!("Registered {} job(s)", registry.len());

    let orchestrator = Orchestrator::new(
        registry,
        execution_log,
        app_config.orchestrator_settings(),
    );
    orchestrator.add_observer(Arc::new(LoggingObserver));
    let mut fatal_errors = orchestrator
        .take_fatal_errors()
        .ok_or_else(|| anyhow::anyhow!("Fatal error channel already taken"))?;
    orchestrator.start()?;

    let server_config = ServerConfig {
        requests_logging_level: app_config.logging_level.clone(),
        port: app_config.port,
        metrics_port: app_config.metrics_port,
    };

    info!("Ready to serve at port {}!", app_config.port);
    info!("Metrics available at port {}!", app_config.metrics_port);

    let result = tokio::select! {
        result = run_server(server_config, orchestrator.handle()) => {
            info!("HTTP server stopped: {:?}", result);
            result
        },
        Some(err) = fatal_errors.recv() => {
            error!("Orchestrator failed: {}", err);
            Err(err.into())
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            Ok(())
        }
    };

    orchestrator.shutdown().await;
    result
}
