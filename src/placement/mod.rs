use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::entities::server;
use crate::db::enums::PanelKind;
use crate::db::services::{account_service, server_service};
use crate::notifications::{NotificationKind, Notifier, NotifyTarget, Priority};
use crate::panel::adapter::AdapterRegistry;
use crate::panel::error::PanelError;
use crate::panel::session::SessionManager;
use crate::panel::types::ClientSpec;

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
    #[error("panel error: {0}")]
    Panel(#[from] PanelError),
    #[error("no server can accept a new account")]
    NoCandidate,
    #[error("account {0} not found")]
    AccountNotFound(i32),
    #[error("server {0} not found")]
    ServerNotFound(i32),
    #[error("server {0} has no enabled inbound to place on")]
    NoTargetInbound(i32),
    /// Add succeeded but the source-side delete failed: the account now
    /// exists on both servers until an operator reconciles.
    #[error("account {account_id} dual-provisioned on servers {from_server} and {to_server}: {source}")]
    DualProvisioned {
        account_id: i32,
        from_server: i32,
        to_server: i32,
        source: PanelError,
    },
}

/// Optional constraints from the order-fulfillment caller.
#[derive(Debug, Clone, Default)]
pub struct PlacementConstraints {
    pub exclude_server: Option<i32>,
    pub panel_kind: Option<PanelKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerLoad {
    pub server_id: i32,
    pub name: String,
    pub current_users: i32,
    pub max_users: i32,
    pub load_ratio: f64,
}

fn load_ratio(server_model: &server::Model) -> f64 {
    if server_model.max_users <= 0 {
        return 1.0;
    }
    server_model.current_users as f64 / server_model.max_users as f64
}

/// Picks the least-loaded eligible server. Only `active` servers with free
/// capacity qualify (overloaded servers keep existing accounts but refuse
/// new placements); ties break on health-failure count, then id, so the
/// choice is deterministic.
pub fn pick(
    candidates: &[server::Model],
    constraints: &PlacementConstraints,
) -> Option<i32> {
    candidates
        .iter()
        .filter(|s| s.is_active())
        .filter(|s| s.current_users < s.max_users)
        .filter(|s| constraints.exclude_server != Some(s.id))
        .filter(|s| constraints.panel_kind.is_none_or(|k| k == s.panel_kind))
        .min_by(|a, b| {
            load_ratio(a)
                .partial_cmp(&load_ratio(b))
                .unwrap_or(Ordering::Equal)
                .then(a.consecutive_health_failures.cmp(&b.consecutive_health_failures))
                .then(a.id.cmp(&b.id))
        })
        .map(|s| s.id)
}

/// Scores servers for new accounts and carries out account moves.
pub struct PlacementSelector {
    db: DatabaseConnection,
    sessions: Arc<SessionManager>,
    registry: Arc<AdapterRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl PlacementSelector {
    pub fn new(
        db: DatabaseConnection,
        sessions: Arc<SessionManager>,
        registry: Arc<AdapterRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            sessions,
            registry,
            notifier,
        }
    }

    pub async fn select_server(
        &self,
        constraints: &PlacementConstraints,
    ) -> Result<i32, PlacementError> {
        let candidates = server_service::get_active_servers(&self.db).await?;
        pick(&candidates, constraints).ok_or(PlacementError::NoCandidate)
    }

    /// Per-server load for the order-fulfillment and admin callers.
    pub async fn server_loads(&self) -> Result<Vec<ServerLoad>, DbErr> {
        let servers = server_service::get_active_servers(&self.db).await?;
        Ok(servers
            .iter()
            .map(|s| ServerLoad {
                server_id: s.id,
                name: s.name.clone(),
                current_users: s.current_users,
                max_users: s.max_users,
                load_ratio: load_ratio(s),
            })
            .collect())
    }

    /// Moves an account to another server, add-first: the client is created
    /// on the target before anything else changes, so a failed add leaves
    /// the account fully intact on its source. Only after the add succeeds
    /// is the ledger repointed and the source-side client deleted; a failed
    /// delete surfaces as `DualProvisioned` for operator reconciliation.
    pub async fn move_account(
        &self,
        account_id: i32,
        to_server_id: i32,
    ) -> Result<(), PlacementError> {
        let account = account_service::get_account_by_id(&self.db, account_id)
            .await?
            .ok_or(PlacementError::AccountNotFound(account_id))?;
        let from_server = server_service::get_server_by_id(&self.db, account.server_id)
            .await?
            .ok_or(PlacementError::ServerNotFound(account.server_id))?;
        let to_server = server_service::get_server_by_id(&self.db, to_server_id)
            .await?
            .ok_or(PlacementError::ServerNotFound(to_server_id))?;

        let to_adapter = self.registry.get(to_server.panel_kind)?;
        let to_session = self.sessions.session_for(&to_server)?;

        let inbounds = to_adapter.list_inbounds(&to_session).await?;
        let target_inbound = inbounds
            .iter()
            .find(|i| i.enable)
            .map(|i| i.id)
            .ok_or(PlacementError::NoTargetInbound(to_server_id))?;

        let spec = ClientSpec {
            uuid: account.remote_uuid.clone(),
            email: account.remote_email.clone(),
            traffic_limit_bytes: account.traffic_limit_bytes,
            expiry_time_ms: account
                .expires_at
                .map(|t| t.timestamp_millis())
                .unwrap_or(0),
            limit_ip: 0,
            flow: None,
        };
        to_adapter
            .add_client(&to_session, target_inbound, &spec)
            .await?;

        // The account lives on the target now; repoint the ledger before
        // touching the source so a delete failure cannot lose it.
        account_service::reassign_account_server(
            &self.db,
            account_id,
            to_server_id,
            target_inbound,
        )
        .await?;

        let delete_result = async {
            let from_adapter = self.registry.get(from_server.panel_kind)?;
            let from_session = self.sessions.session_for(&from_server)?;
            from_adapter
                .delete_client(&from_session, account.inbound_id, &account.remote_uuid)
                .await
        }
        .await;

        match delete_result {
            Ok(()) => {
                info!(
                    account_id = account_id,
                    from_server = from_server.id,
                    to_server = to_server_id,
                    "account moved"
                );
                Ok(())
            }
            Err(source) => {
                let payload = json!({
                    "account_id": account_id,
                    "from_server": from_server.id,
                    "to_server": to_server_id,
                    "at": Utc::now(),
                });
                if let Err(e) = self
                    .notifier
                    .notify(
                        NotifyTarget::Admin,
                        NotificationKind::MoveNeedsReconciliation,
                        payload,
                        Priority::High,
                    )
                    .await
                {
                    warn!(account_id = account_id, error = %e, "failed to send reconciliation notification");
                }
                Err(PlacementError::DualProvisioned {
                    account_id,
                    from_server: from_server.id,
                    to_server: to_server_id,
                    source,
                })
            }
        }
    }
}
