use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::db::entities::server;
use crate::db::enums::ServerStatus;
use crate::db::services::{account_service, server_service, traffic_service};
use crate::notifications::{NotificationKind, Notifier, NotifyTarget, Priority};
use crate::panel::adapter::AdapterRegistry;
use crate::panel::error::PanelError;
use crate::panel::session::SessionManager;
use crate::panel::types::PanelSnapshot;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
    #[error("panel error: {0}")]
    Panel(#[from] PanelError),
    #[error("server {0} not found")]
    ServerNotFound(i32),
    #[error("server {0} is in maintenance")]
    ServerInMaintenance(i32),
}

/// Knobs for the sync jobs, sourced from `EngineConfig`.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub health_failure_threshold: i32,
    pub sync_concurrency: usize,
    pub per_server_timeout: Duration,
    pub metrics_retention_days: i64,
}

/// Result of one full-fleet sweep. A failed server never stops the sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetSyncReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Result of reconciling one server's panel state into the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub clients_seen: usize,
    pub shadows_created: usize,
    pub flagged_missing: u64,
}

/// Pulls remote panel state into the fleet store and applies lifecycle
/// policy. All periodic jobs live here; the scheduler only drives them.
pub struct SyncService {
    db: DatabaseConnection,
    sessions: Arc<SessionManager>,
    registry: Arc<AdapterRegistry>,
    notifier: Arc<dyn Notifier>,
    settings: SyncSettings,
}

impl SyncService {
    pub fn new(
        db: DatabaseConnection,
        sessions: Arc<SessionManager>,
        registry: Arc<AdapterRegistry>,
        notifier: Arc<dyn Notifier>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            db,
            sessions,
            registry,
            notifier,
            settings,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Syncs every non-maintenance server with bounded concurrency. Each
    /// unit carries its own deadline; a slow panel costs itself one health
    /// failure, never the rest of the sweep.
    pub async fn sync_all_servers(self: Arc<Self>) -> Result<FleetSyncReport, DbErr> {
        let servers = server_service::get_syncable_servers(&self.db).await?;
        let semaphore = Arc::new(Semaphore::new(self.settings.sync_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for server_model in servers {
            let service = self.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                let server_id = server_model.id;
                match tokio::time::timeout(
                    service.settings.per_server_timeout,
                    service.sync_server(server_id),
                )
                .await
                {
                    Ok(Ok(outcome)) => {
                        info!(
                            server_id = server_id,
                            clients = outcome.clients_seen,
                            shadows = outcome.shadows_created,
                            "server sync succeeded"
                        );
                        true
                    }
                    Ok(Err(e)) => {
                        error!(server_id = server_id, error = %e, "server sync failed");
                        false
                    }
                    Err(_) => {
                        warn!(server_id = server_id, "server sync timed out");
                        if let Err(e) = server_service::record_sync_failure(
                            &service.db,
                            server_id,
                            service.settings.health_failure_threshold,
                        )
                        .await
                        {
                            error!(server_id = server_id, error = %e, "failed to record sync timeout");
                        }
                        false
                    }
                }
            });
        }

        let mut report = FleetSyncReport::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(true) => report.succeeded += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "sync task panicked");
                    report.failed += 1;
                }
            }
        }
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "fleet sync sweep finished"
        );
        Ok(report)
    }

    /// Syncs one server: fetch panel state, reconcile accounts, recount
    /// users, and only then record health. Upserts strictly precede the
    /// health write so a crash mid-sync never marks a server healthy with
    /// partial data.
    pub async fn sync_server(&self, server_id: i32) -> Result<SyncOutcome, SyncError> {
        let server_model = server_service::get_server_by_id(&self.db, server_id)
            .await?
            .ok_or(SyncError::ServerNotFound(server_id))?;
        if server_model.status == ServerStatus::Maintenance {
            return Err(SyncError::ServerInMaintenance(server_id));
        }

        let adapter = self.registry.get(server_model.panel_kind)?;
        let session = self.sessions.session_for(&server_model)?;

        let snapshot = match adapter.list_inbounds(&session).await {
            Ok(inbounds) => match adapter.traffic_stats(&session).await {
                Ok(traffic) => PanelSnapshot { inbounds, traffic },
                Err(e) => return Err(self.note_sync_failure(server_id, e).await),
            },
            Err(e) => return Err(self.note_sync_failure(server_id, e).await),
        };

        let outcome = self.apply_server_snapshot(&server_model, &snapshot).await?;
        server_service::update_user_count(&self.db, server_id, outcome.clients_seen as i32)
            .await?;
        server_service::record_sync_success(&self.db, server_id).await?;

        if outcome.shadows_created > 0 || outcome.flagged_missing > 0 {
            let payload = json!({
                "server_id": server_id,
                "shadows_created": outcome.shadows_created,
                "flagged_missing": outcome.flagged_missing,
            });
            if let Err(e) = self
                .notifier
                .notify(
                    NotifyTarget::Admin,
                    NotificationKind::AccountNeedsReview,
                    payload,
                    Priority::Normal,
                )
                .await
            {
                warn!(server_id = server_id, error = %e, "failed to send review notification");
            }
        }
        Ok(outcome)
    }

    async fn note_sync_failure(&self, server_id: i32, cause: PanelError) -> SyncError {
        match server_service::record_sync_failure(
            &self.db,
            server_id,
            self.settings.health_failure_threshold,
        )
        .await
        {
            Ok(failures) if failures == self.settings.health_failure_threshold => {
                let payload = json!({ "server_id": server_id, "failures": failures });
                if let Err(e) = self
                    .notifier
                    .notify(
                        NotifyTarget::Admin,
                        NotificationKind::ServerOffline,
                        payload,
                        Priority::High,
                    )
                    .await
                {
                    warn!(server_id = server_id, error = %e, "failed to send offline notification");
                }
                SyncError::Panel(cause)
            }
            Ok(_) => SyncError::Panel(cause),
            // The store itself is unavailable; that outranks the panel error.
            Err(db_err) => SyncError::Db(db_err),
        }
    }

    /// Reconciles a panel snapshot into the ledger. The panel is the source
    /// of truth for which clients exist; the ledger stays authoritative for
    /// the limits and expiry we set. Discrepancies are flagged, not deleted.
    pub async fn apply_server_snapshot(
        &self,
        server_model: &server::Model,
        snapshot: &PanelSnapshot,
    ) -> Result<SyncOutcome, DbErr> {
        let mut outcome = SyncOutcome::default();
        let mut seen_uuids = Vec::new();

        for inbound in &snapshot.inbounds {
            for client in &inbound.clients {
                if client.uuid.is_empty() {
                    warn!(
                        server_id = server_model.id,
                        inbound_id = inbound.id,
                        email = %client.email,
                        "skipping remote client without uuid"
                    );
                    continue;
                }
                seen_uuids.push(client.uuid.clone());
                outcome.clients_seen += 1;
                let upserted = account_service::upsert_remote_client(
                    &self.db,
                    server_model.id,
                    inbound.id,
                    client,
                )
                .await?;
                if upserted == account_service::UpsertOutcome::ShadowCreated {
                    outcome.shadows_created += 1;
                }
            }
        }

        outcome.flagged_missing = account_service::flag_accounts_missing_remotely(
            &self.db,
            server_model.id,
            &seen_uuids,
        )
        .await?;
        Ok(outcome)
    }

    /// Batch transition for accounts past expiry. Idempotent.
    pub async fn check_expired_accounts(&self) -> Result<u64, DbErr> {
        let transitioned = account_service::mark_expired_accounts(&self.db, Utc::now()).await?;
        if transitioned > 0 {
            info!(count = transitioned, "expired accounts transitioned");
        }
        Ok(transitioned)
    }

    /// Batch transition for limited accounts at or over their limit.
    pub async fn check_traffic_limits(&self) -> Result<u64, DbErr> {
        let transitioned = account_service::suspend_over_limit_accounts(&self.db).await?;
        if transitioned > 0 {
            info!(count = transitioned, "over-limit accounts suspended");
        }
        Ok(transitioned)
    }

    /// Appends one traffic sample per active server. A panel failure skips
    /// that server; only a store failure aborts the batch.
    pub async fn collect_server_metrics(&self) -> Result<usize, DbErr> {
        let servers = server_service::get_active_servers(&self.db).await?;
        let mut collected = 0;
        for server_model in servers {
            match self.fetch_server_totals(&server_model).await {
                Ok((up, down)) => {
                    traffic_service::insert_sample(
                        &self.db,
                        server_model.id,
                        None,
                        up,
                        down,
                        Utc::now(),
                    )
                    .await?;
                    collected += 1;
                }
                Err(e) => {
                    warn!(server_id = server_model.id, error = %e, "metrics collection skipped server");
                }
            }
        }
        Ok(collected)
    }

    async fn fetch_server_totals(
        &self,
        server_model: &server::Model,
    ) -> Result<(i64, i64), PanelError> {
        let adapter = self.registry.get(server_model.panel_kind)?;
        let session = self.sessions.session_for(server_model)?;
        let stats = adapter.traffic_stats(&session).await?;
        let up = stats.values().map(|t| t.up).sum();
        let down = stats.values().map(|t| t.down).sum();
        Ok((up, down))
    }

    /// Prunes traffic samples past the retention window.
    pub async fn cleanup_old_metrics(&self) -> Result<u64, DbErr> {
        let deleted = traffic_service::cleanup_old_samples(
            &self.db,
            self.settings.metrics_retention_days,
            Utc::now(),
        )
        .await?;
        if deleted > 0 {
            info!(count = deleted, "old traffic samples pruned");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::AccountStatus;
    use crate::db::services::account_service::get_accounts_for_server;
    use crate::notifications::LogNotifier;
    use crate::panel::types::{RemoteClient, RemoteInbound};
    use crate::test_support::{seed_account, seed_server, setup_db};

    fn service(db: DatabaseConnection) -> Arc<SyncService> {
        Arc::new(SyncService::new(
            db,
            Arc::new(SessionManager::new(Duration::from_secs(5))),
            Arc::new(AdapterRegistry::with_builtin()),
            Arc::new(LogNotifier),
            SyncSettings {
                health_failure_threshold: 3,
                sync_concurrency: 4,
                per_server_timeout: Duration::from_secs(10),
                metrics_retention_days: 30,
            },
        ))
    }

    fn snapshot_with(clients: Vec<RemoteClient>) -> PanelSnapshot {
        PanelSnapshot {
            inbounds: vec![RemoteInbound {
                id: 11,
                remark: "edge".into(),
                protocol: "vless".into(),
                port: 443,
                enable: true,
                up: 0,
                down: 0,
                total: 0,
                expiry_time_ms: 0,
                clients,
            }],
            traffic: Default::default(),
        }
    }

    fn remote(uuid: &str, email: &str, up: i64, down: i64) -> RemoteClient {
        RemoteClient {
            uuid: uuid.into(),
            email: email.into(),
            up,
            down,
            total_bytes: 0,
            expiry_time_ms: 0,
            limit_ip: 0,
            flow: None,
            enable: true,
        }
    }

    #[tokio::test]
    async fn snapshot_apply_updates_known_and_shadows_unknown() {
        let db = setup_db().await;
        let server_model = seed_server(&db, |_| {}).await;
        let known = seed_account(&db, server_model.id, |a| {
            a.remote_uuid = "u-known".into();
            a.remote_email = "known@x".into();
        })
        .await;

        let svc = service(db.clone());
        let snapshot = snapshot_with(vec![
            remote("u-known", "known@x", 100, 200),
            remote("u-ghost", "ghost@x", 1, 1),
        ]);
        let outcome = svc
            .apply_server_snapshot(&server_model, &snapshot)
            .await
            .unwrap();

        assert_eq!(outcome.clients_seen, 2);
        assert_eq!(outcome.shadows_created, 1);
        assert_eq!(outcome.flagged_missing, 0);

        let accounts = get_accounts_for_server(&db, server_model.id).await.unwrap();
        assert_eq!(accounts.len(), 2);
        let known_row = accounts.iter().find(|a| a.id == known.id).unwrap();
        assert_eq!(known_row.used_bytes, 300);
        assert_eq!(known_row.inbound_id, 11);
        assert!(!known_row.needs_review);
        let ghost_row = accounts.iter().find(|a| a.remote_uuid == "u-ghost").unwrap();
        assert!(ghost_row.needs_review);
    }

    #[tokio::test]
    async fn snapshot_apply_flags_accounts_the_panel_dropped() {
        let db = setup_db().await;
        let server_model = seed_server(&db, |_| {}).await;
        let vanished = seed_account(&db, server_model.id, |a| {
            a.remote_uuid = "u-vanished".into();
        })
        .await;

        let svc = service(db.clone());
        let outcome = svc
            .apply_server_snapshot(&server_model, &snapshot_with(vec![]))
            .await
            .unwrap();
        assert_eq!(outcome.flagged_missing, 1);

        let fetched = account_service::get_account_by_id(&db, vanished.id)
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.needs_review);
        // Existence authority stays with the panel, but we never delete.
        assert_eq!(fetched.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn sweeps_are_idempotent() {
        let db = setup_db().await;
        let server_model = seed_server(&db, |_| {}).await;
        seed_account(&db, server_model.id, |a| {
            a.expires_at = Some(Utc::now() - chrono::Duration::hours(2));
        })
        .await;
        seed_account(&db, server_model.id, |a| {
            a.remote_email = "heavy@x".into();
            a.traffic_limit_bytes = 100;
            a.used_bytes = 150;
        })
        .await;

        let svc = service(db.clone());
        assert_eq!(svc.check_expired_accounts().await.unwrap(), 1);
        assert_eq!(svc.check_expired_accounts().await.unwrap(), 0);
        assert_eq!(svc.check_traffic_limits().await.unwrap(), 1);
        assert_eq!(svc.check_traffic_limits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sync_server_refuses_maintenance() {
        let db = setup_db().await;
        let server_model = seed_server(&db, |s| {
            s.status = ServerStatus::Maintenance;
        })
        .await;

        let svc = service(db);
        let err = svc.sync_server(server_model.id).await.unwrap_err();
        assert!(matches!(err, SyncError::ServerInMaintenance(id) if id == server_model.id));
    }
}
