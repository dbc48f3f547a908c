//! msgrelay runtime - main entry point
//!
//! Loads the TOML configuration, builds the default agent, starts the HTTP,
//! scheduled pickup and batch pickup receivers, and serves health endpoints
//! until a shutdown signal arrives.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use msgrelay::agent::{Agent, ReceivedItemTransformer, StoreExceptionHandler};
use msgrelay::config::{PickupMode, RuntimeConfig};
use msgrelay::error::{RuntimeError, StepFault};
use msgrelay::observability::{
    health::HealthServer, init_default_logging, init_logging, metrics::metrics, LogFormat,
};
use msgrelay::persistence::InMemoryExceptionStore;
use msgrelay::pipeline::{LogContextStep, PipelineBuilder};
use msgrelay::receivers::{
    BatchReceiver, DirectoryPollTarget, HttpReceiver, ItemHandler, ReceivedItem, Receiver,
    ScheduledReceiver,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

/// Store-and-forward message runtime
#[derive(Parser)]
#[command(name = "msgrelay")]
#[command(about = "Receive, schedule and process partner messages")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start receivers and process items until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Pretty, false),
        _ => init_logging(Level::TRACE, LogFormat::Pretty, true),
    }

    info!("Starting msgrelay v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_runtime(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<RuntimeConfig, RuntimeError> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(RuntimeConfig::load_from_file(path)?);
    }

    for path_str in ["msgrelay.toml", "config/msgrelay.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(RuntimeConfig::load_from_file(&path)?);
        }
    }

    error!("No configuration file found. Provide one with -c/--config or create msgrelay.toml");
    process::exit(1);
}

/// Agent wrapper that reports processed items to the health server
struct TrackedAgent {
    agent: Agent<ReceivedItem>,
    health: Arc<HealthServer>,
}

#[async_trait]
impl ItemHandler<ReceivedItem> for TrackedAgent {
    async fn handle_item(&self, item: ReceivedItem) -> Result<(), StepFault> {
        let result = self.agent.handle_item(item).await;
        self.health
            .set_last_item_processed(chrono::Utc::now().timestamp().max(0) as u64);
        result
    }
}

fn build_agent(config: &RuntimeConfig) -> Agent<ReceivedItem> {
    let store = Arc::new(InMemoryExceptionStore::new());
    let pipeline = PipelineBuilder::new().step(LogContextStep).build();

    Agent::new(
        format!("{}-agent", config.runtime.id),
        Arc::new(ReceivedItemTransformer::new(config.runtime.pipeline.clone())),
    )
    .with_pipeline(pipeline)
    .with_exception_handler(Arc::new(StoreExceptionHandler::new(store)))
}

fn build_receivers(config: &RuntimeConfig) -> Result<Vec<Box<dyn Receiver>>, RuntimeError> {
    let mut receivers: Vec<Box<dyn Receiver>> = Vec::new();

    if let Some(settings) = config.http_settings() {
        let mut http = HttpReceiver::new("http");
        http.configure(&settings)?;
        receivers.push(Box::new(http));
    }

    let mut scheduled = ScheduledReceiver::new("pickup");
    scheduled.configure(&config.scheduler_settings())?;
    for target in config.pickups(PickupMode::Scheduled) {
        scheduled.add_target_with_bounds(
            DirectoryPollTarget::new(target.key.clone(), target.directory.clone()),
            target.min_interval_secs.map(Duration::from_secs_f64),
            target.max_interval_secs.map(Duration::from_secs_f64),
        );
    }
    if scheduled.target_count() > 0 {
        receivers.push(Box::new(scheduled));
    }

    let batch_settings = config.batch_settings();
    for target in config.pickups(PickupMode::Batch) {
        let mut batch = BatchReceiver::new(
            format!("batch:{}", target.key),
            DirectoryPollTarget::new(target.key.clone(), target.directory.clone()),
        );
        batch.configure(&batch_settings)?;
        receivers.push(Box::new(batch));
    }

    Ok(receivers)
}

async fn run_runtime(config: RuntimeConfig) -> Result<(), RuntimeError> {
    info!(runtime_id = %config.runtime.id, "Runtime starting");

    let collector = metrics();
    let cancel = CancellationToken::new();

    let health_server = Arc::new(HealthServer::new(
        config.runtime.id.clone(),
        config.health.port,
    ));
    let health_task = {
        let server = health_server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(cancel).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let handler: Arc<dyn ItemHandler<ReceivedItem>> = Arc::new(TrackedAgent {
        agent: build_agent(&config),
        health: health_server.clone(),
    });

    let mut receivers = build_receivers(&config)?;
    if receivers.is_empty() {
        warn!("No receivers configured; only health endpoints will be served");
    }
    for receiver in receivers.iter_mut() {
        receiver.start_receiving(handler.clone(), cancel.clone()).await?;
    }

    collector.set_receivers_running(receivers.len() as u64);
    collector.update_health_status(true);
    health_server.set_receivers_running(true);

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(receivers = receivers.len(), "Runtime is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    health_server.set_receivers_running(false);
    collector.update_health_status(false);

    let mut first_error = None;
    for receiver in receivers.iter_mut() {
        if let Err(e) = receiver.stop_receiving().await {
            error!(receiver = receiver.name(), "Error during shutdown: {}", e);
            first_error.get_or_insert(e);
        }
    }
    collector.set_receivers_running(0);

    cancel.cancel();
    if let Err(e) = health_task.await {
        warn!("Health server task ended abnormally: {}", e);
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn handle_config_command(config: RuntimeConfig, show: bool) -> Result<(), RuntimeError> {
    if show {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("Current configuration:");
                println!("{rendered}");
            }
            Err(e) => warn!("Could not render configuration: {}", e),
        }
    }

    info!("Configuration validation complete");
    Ok(())
}
