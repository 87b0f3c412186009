use std::sync::Arc;

use sea_orm::{DatabaseConnection, DbErr};
use serde_json::json;
use tracing::{info, warn};

use crate::db::entities::account;
use crate::db::services::account_service;
use crate::notifications::{NotificationKind, Notifier, NotifyTarget, Priority};

/// Percent checkpoints of `traffic_limit_bytes` at which usage warnings go
/// out, each at most once per cycle.
pub const WARNING_LADDER: [i16; 4] = [50, 75, 90, 95];

/// Highest ladder threshold at or below the current usage, `None` below the
/// lowest rung or for unlimited accounts.
pub fn highest_crossed_threshold(used_bytes: i64, limit_bytes: i64) -> Option<i16> {
    if limit_bytes <= 0 {
        return None;
    }
    let percent = used_bytes.saturating_mul(100) / limit_bytes;
    WARNING_LADDER
        .iter()
        .rev()
        .find(|&&threshold| percent >= threshold as i64)
        .copied()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnforcementReport {
    pub suspended: usize,
    pub warned: usize,
}

/// Walks the active, limited accounts: suspends anything at or over its
/// limit and emits ladder warnings, one per threshold crossing.
pub struct TrafficEnforcer {
    db: DatabaseConnection,
    notifier: Arc<dyn Notifier>,
}

impl TrafficEnforcer {
    pub fn new(db: DatabaseConnection, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, notifier }
    }

    pub async fn enforce(&self) -> Result<EnforcementReport, DbErr> {
        let accounts = account_service::get_enforceable_accounts(&self.db).await?;
        let mut report = EnforcementReport::default();

        for account_model in accounts {
            if account_model.has_exceeded_traffic_limit() {
                // Suspension itself is the sweep's transition; status
                // predication makes a lost race a no-op.
                let rows = account_service::suspend_account(&self.db, account_model.id).await?;
                if rows > 0 {
                    report.suspended += 1;
                    self.emit(
                        &account_model,
                        NotificationKind::TrafficExceeded,
                        Priority::High,
                    )
                    .await;
                    info!(account_id = account_model.id, "account suspended for traffic");
                }
                continue;
            }

            let Some(threshold) = highest_crossed_threshold(
                account_model.used_bytes,
                account_model.traffic_limit_bytes,
            ) else {
                continue;
            };
            if threshold <= account_model.last_warned_percent.unwrap_or(0) {
                continue;
            }
            self.emit(
                &account_model,
                NotificationKind::TrafficWarning { percent: threshold },
                Priority::Normal,
            )
            .await;
            account_service::set_last_warned_percent(&self.db, account_model.id, threshold)
                .await?;
            report.warned += 1;
        }
        Ok(report)
    }

    async fn emit(&self, account_model: &account::Model, kind: NotificationKind, priority: Priority) {
        let payload = json!({
            "account_id": account_model.id,
            "server_id": account_model.server_id,
            "used_bytes": account_model.used_bytes,
            "traffic_limit_bytes": account_model.traffic_limit_bytes,
        });
        if let Err(e) = self
            .notifier
            .notify(NotifyTarget::Account(account_model.id), kind, payload, priority)
            .await
        {
            warn!(account_id = account_model.id, error = %e, "failed to send traffic notification");
        }
    }
}
