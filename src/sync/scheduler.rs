use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

use crate::sync::service::SyncService;
use crate::traffic::enforcer::TrafficEnforcer;

/// Per-job intervals. The jobs are independent; there is no global lock
/// step, and one job overrunning only delays its own next tick.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub fleet_sync_interval: Duration,
    pub metrics_interval: Duration,
    pub sweep_interval: Duration,
    pub cleanup_interval: Duration,
}

/// Drives the periodic jobs. A single scheduler instance is assumed; the
/// jobs themselves are idempotent.
pub struct SyncScheduler {
    service: Arc<SyncService>,
    enforcer: Arc<TrafficEnforcer>,
    schedule: ScheduleSettings,
}

impl SyncScheduler {
    pub fn new(
        service: Arc<SyncService>,
        enforcer: Arc<TrafficEnforcer>,
        schedule: ScheduleSettings,
    ) -> Self {
        Self {
            service,
            enforcer,
            schedule,
        }
    }

    /// Spawns every periodic loop and returns their handles.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let scheduler = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(scheduler.schedule.fleet_sync_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.service.clone().sync_all_servers().await {
                    error!(error = %e, "fleet sync sweep aborted");
                }
            }
        }));

        let scheduler = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(scheduler.schedule.metrics_interval);
            loop {
                ticker.tick().await;
                match scheduler.service.collect_server_metrics().await {
                    Ok(collected) => {
                        info!(collected = collected, "metrics collection pass finished")
                    }
                    Err(e) => error!(error = %e, "metrics collection aborted"),
                }
            }
        }));

        let scheduler = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(scheduler.schedule.sweep_interval);
            loop {
                ticker.tick().await;
                scheduler.run_policy_sweeps().await;
            }
        }));

        let scheduler = self;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(scheduler.schedule.cleanup_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.service.cleanup_old_metrics().await {
                    error!(error = %e, "metrics retention cleanup aborted");
                }
            }
        }));

        info!("sync scheduler started");
        tasks
    }

    /// Expiry sweep, then the enforcer (notifications plus per-account
    /// suspensions), then the batch limit sweep as a backstop for anything
    /// the enforcer could not finish.
    async fn run_policy_sweeps(&self) {
        if let Err(e) = self.service.check_expired_accounts().await {
            error!(error = %e, "expiry sweep aborted");
        }
        if let Err(e) = self.enforcer.enforce().await {
            error!(error = %e, "traffic enforcement aborted");
        }
        if let Err(e) = self.service.check_traffic_limits().await {
            error!(error = %e, "traffic limit sweep aborted");
        }
    }

    /// One full pass of everything, for the `--once` CLI mode.
    pub async fn run_once(&self) {
        if let Err(e) = self.service.clone().sync_all_servers().await {
            error!(error = %e, "fleet sync sweep aborted");
        }
        self.run_policy_sweeps().await;
        if let Err(e) = self.service.collect_server_metrics().await {
            error!(error = %e, "metrics collection aborted");
        }
        if let Err(e) = self.service.cleanup_old_metrics().await {
            error!(error = %e, "metrics retention cleanup aborted");
        }
    }
}
