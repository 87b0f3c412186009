use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sea_orm::Database;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetsync::config::EngineConfig;
use fleetsync::notifications::webhook::WebhookNotifier;
use fleetsync::notifications::{LogNotifier, Notifier};
use fleetsync::panel::adapter::AdapterRegistry;
use fleetsync::panel::session::SessionManager;
use fleetsync::sync::scheduler::{ScheduleSettings, SyncScheduler};
use fleetsync::sync::service::{SyncService, SyncSettings};
use fleetsync::traffic::enforcer::TrafficEnforcer;

#[derive(Parser, Debug)]
#[command(name = "engine", version, about = "Fleet synchronization engine")]
struct Args {
    /// Run one full sweep (sync, sweeps, metrics, cleanup) and exit.
    #[arg(long)]
    once: bool,
}

fn init_logging() {
    // JSON to a daily-rolling file, human-readable to stdout.
    let file_appender = rolling::daily("logs", "engine.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    dotenv::dotenv().ok();
    init_logging();

    let config = EngineConfig::from_env()?;
    let db = Database::connect(&config.database_url).await?;
    info!("connected to fleet store");

    let sessions = Arc::new(SessionManager::new(Duration::from_secs(
        config.panel_timeout_secs,
    )));
    let registry = Arc::new(AdapterRegistry::with_builtin());
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let service = Arc::new(SyncService::new(
        db.clone(),
        sessions,
        registry,
        notifier.clone(),
        SyncSettings {
            health_failure_threshold: config.health_failure_threshold,
            sync_concurrency: config.sync_concurrency,
            per_server_timeout: Duration::from_secs(config.panel_timeout_secs * 4),
            metrics_retention_days: config.metrics_retention_days,
        },
    ));
    let enforcer = Arc::new(TrafficEnforcer::new(db, notifier));
    let scheduler = Arc::new(SyncScheduler::new(
        service,
        enforcer,
        ScheduleSettings {
            fleet_sync_interval: Duration::from_secs(config.fleet_sync_interval_secs),
            metrics_interval: Duration::from_secs(config.metrics_interval_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
        },
    ));

    if args.once {
        scheduler.run_once().await;
        return Ok(());
    }

    let tasks = scheduler.spawn();
    info!(jobs = tasks.len(), "engine running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, stopping jobs");
    for task in tasks {
        task.abort();
    }
    Ok(())
}
