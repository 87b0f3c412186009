use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use tracing::warn;

use crate::db::entities::account;
use crate::db::enums::AccountStatus;
use crate::panel::types::RemoteClient;

// --- Account Service Functions ---

/// Outcome of reconciling one panel-reported client against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Updated,
    /// The panel reported a client the ledger had no record of. The panel is
    /// the source of truth for existence, so a shadow row was created and
    /// flagged for admin review instead of deleting the remote client.
    ShadowCreated,
}

pub async fn get_account_by_id(
    db: &DatabaseConnection,
    account_id: i32,
) -> Result<Option<account::Model>, DbErr> {
    account::Entity::find_by_id(account_id).one(db).await
}

pub async fn get_accounts_for_server(
    db: &DatabaseConnection,
    server_id: i32,
) -> Result<Vec<account::Model>, DbErr> {
    account::Entity::find()
        .filter(account::Column::ServerId.eq(server_id))
        .order_by_asc(account::Column::Id)
        .all(db)
        .await
}

/// Active accounts with a traffic limit, the enforcement working set.
pub async fn get_enforceable_accounts(
    db: &DatabaseConnection,
) -> Result<Vec<account::Model>, DbErr> {
    account::Entity::find()
        .filter(account::Column::Status.eq(AccountStatus::Active))
        .filter(account::Column::TrafficLimitBytes.gt(0))
        .order_by_asc(account::Column::Id)
        .all(db)
        .await
}

/// Reconciles one panel-reported client into the ledger, matching by
/// `remote_uuid` or `remote_email` on the same server. `used_bytes` is kept
/// monotonically non-decreasing: a lower panel value (counter reset after a
/// panel restart) keeps the stored maximum.
pub async fn upsert_remote_client(
    db: &DatabaseConnection,
    server_id: i32,
    inbound_id: i64,
    client: &RemoteClient,
) -> Result<UpsertOutcome, DbErr> {
    let now = Utc::now();
    let existing = account::Entity::find()
        .filter(account::Column::ServerId.eq(server_id))
        .filter(
            Condition::any()
                .add(account::Column::RemoteUuid.eq(client.uuid.as_str()))
                .add(account::Column::RemoteEmail.eq(client.email.as_str())),
        )
        .one(db)
        .await?;

    let reported_used = client.up + client.down;

    match existing {
        Some(model) => {
            let used = reported_used.max(model.used_bytes);
            let mut active_model = model.into_active_model();
            active_model.inbound_id = Set(inbound_id);
            active_model.remote_uuid = Set(client.uuid.clone());
            active_model.remote_email = Set(client.email.clone());
            active_model.used_bytes = Set(used);
            active_model.updated_at = Set(now);
            active_model.update(db).await?;
            Ok(UpsertOutcome::Updated)
        }
        None => {
            warn!(
                server_id = server_id,
                remote_email = %client.email,
                "panel reports a client unknown to the ledger, creating shadow account"
            );
            let shadow = account::ActiveModel {
                server_id: Set(server_id),
                remote_uuid: Set(client.uuid.clone()),
                inbound_id: Set(inbound_id),
                remote_email: Set(client.email.clone()),
                status: Set(AccountStatus::Active),
                // Limits and expiry are ours to set; a shadow row starts
                // unlimited until an operator claims it.
                traffic_limit_bytes: Set(0),
                used_bytes: Set(reported_used),
                expires_at: Set(None),
                last_warned_percent: Set(None),
                needs_review: Set(true),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            shadow.insert(db).await?;
            Ok(UpsertOutcome::ShadowCreated)
        }
    }
}

/// Flags active accounts on a server that the panel no longer reports.
/// They are never deleted here; an operator resolves the discrepancy.
pub async fn flag_accounts_missing_remotely(
    db: &DatabaseConnection,
    server_id: i32,
    seen_uuids: &[String],
) -> Result<u64, DbErr> {
    let now = Utc::now();
    let mut query = account::Entity::update_many()
        .col_expr(account::Column::NeedsReview, Expr::value(true))
        .col_expr(account::Column::UpdatedAt, Expr::value(now))
        .filter(account::Column::ServerId.eq(server_id))
        .filter(account::Column::Status.eq(AccountStatus::Active))
        .filter(account::Column::NeedsReview.eq(false));
    if !seen_uuids.is_empty() {
        query = query.filter(account::Column::RemoteUuid.is_not_in(seen_uuids.iter().cloned()));
    }
    let result = query.exec(db).await?;
    Ok(result.rows_affected)
}

/// Batch transition `active -> expired` for accounts past their expiry.
/// Traffic state is irrelevant to this sweep. Returns rows transitioned.
pub async fn mark_expired_accounts(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let result = account::Entity::update_many()
        .col_expr(account::Column::Status, Expr::value(AccountStatus::Expired))
        .col_expr(account::Column::UpdatedAt, Expr::value(now))
        .filter(account::Column::Status.eq(AccountStatus::Active))
        .filter(account::Column::ExpiresAt.is_not_null())
        .filter(account::Column::ExpiresAt.lt(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Batch transition `active -> suspended` for limited accounts at or over
/// their traffic limit. Returns rows transitioned.
pub async fn suspend_over_limit_accounts(db: &DatabaseConnection) -> Result<u64, DbErr> {
    let now = Utc::now();
    let result = account::Entity::update_many()
        .col_expr(
            account::Column::Status,
            Expr::value(AccountStatus::Suspended),
        )
        .col_expr(account::Column::UpdatedAt, Expr::value(now))
        .filter(account::Column::Status.eq(AccountStatus::Active))
        .filter(account::Column::TrafficLimitBytes.gt(0))
        .filter(
            Expr::col((account::Entity, account::Column::UsedBytes))
                .gte(Expr::col((account::Entity, account::Column::TrafficLimitBytes))),
        )
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Suspends a single account. Status-predicated so a racing renewal makes
/// this a no-op rather than a lost update.
pub async fn suspend_account(db: &DatabaseConnection, account_id: i32) -> Result<u64, DbErr> {
    let now = Utc::now();
    let result = account::Entity::update_many()
        .col_expr(
            account::Column::Status,
            Expr::value(AccountStatus::Suspended),
        )
        .col_expr(account::Column::UpdatedAt, Expr::value(now))
        .filter(account::Column::Id.eq(account_id))
        .filter(account::Column::Status.eq(AccountStatus::Active))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Renewal: `{expired, suspended, active} -> active` with a fresh cycle.
/// Resets usage and the warning ladder, extends expiry. Cancelled is
/// terminal and rejected.
pub async fn renew_account(
    db: &DatabaseConnection,
    account_id: i32,
    new_expires_at: Option<DateTime<Utc>>,
) -> Result<account::Model, DbErr> {
    let model = account::Entity::find_by_id(account_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("account {} not found", account_id)))?;

    if model.status == AccountStatus::Cancelled {
        return Err(DbErr::Custom(format!(
            "account {} is cancelled and cannot be renewed",
            account_id
        )));
    }

    let mut active_model = model.into_active_model();
    active_model.status = Set(AccountStatus::Active);
    active_model.used_bytes = Set(0);
    active_model.last_warned_percent = Set(None);
    active_model.expires_at = Set(new_expires_at);
    active_model.updated_at = Set(Utc::now());
    active_model.update(db).await
}

/// Logical deletion: any non-terminal state `-> cancelled`. Idempotent.
pub async fn cancel_account(
    db: &DatabaseConnection,
    account_id: i32,
) -> Result<account::Model, DbErr> {
    let model = account::Entity::find_by_id(account_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("account {} not found", account_id)))?;

    if model.status == AccountStatus::Cancelled {
        return Ok(model);
    }

    let mut active_model = model.into_active_model();
    active_model.status = Set(AccountStatus::Cancelled);
    active_model.updated_at = Set(Utc::now());
    active_model.update(db).await
}

/// Repoints an account at another server after a successful move. Remote
/// identifiers stay as-is; the client carries its uuid across panels.
pub async fn reassign_account_server(
    db: &DatabaseConnection,
    account_id: i32,
    server_id: i32,
    inbound_id: i64,
) -> Result<account::Model, DbErr> {
    let model = account::Entity::find_by_id(account_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("account {} not found", account_id)))?;

    let mut active_model = model.into_active_model();
    active_model.server_id = Set(server_id);
    active_model.inbound_id = Set(inbound_id);
    active_model.updated_at = Set(Utc::now());
    active_model.update(db).await
}

/// Records the highest warning-ladder percentage already notified, so a
/// threshold is announced at most once per cycle.
pub async fn set_last_warned_percent(
    db: &DatabaseConnection,
    account_id: i32,
    percent: i16,
) -> Result<u64, DbErr> {
    let now = Utc::now();
    let result = account::Entity::update_many()
        .col_expr(account::Column::LastWarnedPercent, Expr::value(percent))
        .col_expr(account::Column::UpdatedAt, Expr::value(now))
        .filter(account::Column::Id.eq(account_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_account, seed_server, setup_db};
    use chrono::Duration;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn remote(uuid: &str, email: &str, up: i64, down: i64) -> RemoteClient {
        RemoteClient {
            uuid: uuid.to_string(),
            email: email.to_string(),
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
    async fn expiry_sweep_only_touches_past_due_active_accounts() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;
        let now = Utc::now();

        let past_due = seed_account(&db, server.id, |a| {
            a.expires_at = Some(now - Duration::hours(1));
        })
        .await;
        let current = seed_account(&db, server.id, |a| {
            a.remote_email = "current@x".into();
            a.expires_at = Some(now + Duration::hours(1));
        })
        .await;
        let unlimited = seed_account(&db, server.id, |a| {
            a.remote_email = "unlimited@x".into();
            a.expires_at = None;
        })
        .await;
        // Over its traffic limit as well, but expiry ignores traffic state.
        let over_limit_past_due = seed_account(&db, server.id, |a| {
            a.remote_email = "both@x".into();
            a.expires_at = Some(now - Duration::days(2));
            a.traffic_limit_bytes = GIB;
            a.used_bytes = 2 * GIB;
        })
        .await;

        let transitioned = mark_expired_accounts(&db, now).await.unwrap();
        assert_eq!(transitioned, 2);

        let get = |id| get_account_by_id(&db, id);
        assert_eq!(get(past_due.id).await.unwrap().unwrap().status, AccountStatus::Expired);
        assert_eq!(get(current.id).await.unwrap().unwrap().status, AccountStatus::Active);
        assert_eq!(get(unlimited.id).await.unwrap().unwrap().status, AccountStatus::Active);
        assert_eq!(
            get(over_limit_past_due.id).await.unwrap().unwrap().status,
            AccountStatus::Expired
        );
    }

    #[tokio::test]
    async fn traffic_sweep_suspends_accounts_at_or_over_limit() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;

        let exactly_at = seed_account(&db, server.id, |a| {
            a.traffic_limit_bytes = 5 * GIB;
            a.used_bytes = 5 * GIB;
        })
        .await;
        let under = seed_account(&db, server.id, |a| {
            a.remote_email = "under@x".into();
            a.traffic_limit_bytes = 5 * GIB;
            a.used_bytes = 4 * GIB;
        })
        .await;
        let unlimited = seed_account(&db, server.id, |a| {
            a.remote_email = "unlimited@x".into();
            a.traffic_limit_bytes = 0;
            a.used_bytes = 100 * GIB;
        })
        .await;

        let transitioned = suspend_over_limit_accounts(&db).await.unwrap();
        assert_eq!(transitioned, 1);

        let fetched = get_account_by_id(&db, exactly_at.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, AccountStatus::Suspended);
        assert!(fetched.has_exceeded_traffic_limit());
        assert_eq!(
            get_account_by_id(&db, under.id).await.unwrap().unwrap().status,
            AccountStatus::Active
        );
        assert_eq!(
            get_account_by_id(&db, unlimited.id).await.unwrap().unwrap().status,
            AccountStatus::Active
        );
    }

    #[tokio::test]
    async fn upsert_updates_known_client_and_keeps_usage_monotonic() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;
        let account = seed_account(&db, server.id, |a| {
            a.remote_uuid = "u-1".into();
            a.remote_email = "a@x".into();
            a.used_bytes = 900;
        })
        .await;

        let outcome = upsert_remote_client(&db, server.id, 7, &remote("u-1", "a@x", 600, 500))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        let fetched = get_account_by_id(&db, account.id).await.unwrap().unwrap();
        assert_eq!(fetched.used_bytes, 1100);
        assert_eq!(fetched.inbound_id, 7);

        // Panel counter reset: reported usage drops, ledger keeps the max.
        let outcome = upsert_remote_client(&db, server.id, 7, &remote("u-1", "a@x", 10, 20))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        let fetched = get_account_by_id(&db, account.id).await.unwrap().unwrap();
        assert_eq!(fetched.used_bytes, 1100);
    }

    #[tokio::test]
    async fn unknown_remote_client_becomes_flagged_shadow_row() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;

        let outcome =
            upsert_remote_client(&db, server.id, 3, &remote("ghost", "ghost@x", 5, 5))
                .await
                .unwrap();
        assert_eq!(outcome, UpsertOutcome::ShadowCreated);

        let accounts = get_accounts_for_server(&db, server.id).await.unwrap();
        assert_eq!(accounts.len(), 1);
        let shadow = &accounts[0];
        assert!(shadow.needs_review);
        assert_eq!(shadow.status, AccountStatus::Active);
        assert_eq!(shadow.traffic_limit_bytes, 0);
        assert_eq!(shadow.used_bytes, 10);
    }

    #[tokio::test]
    async fn accounts_missing_remotely_are_flagged_not_deleted() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;
        let present = seed_account(&db, server.id, |a| a.remote_uuid = "u-here".into()).await;
        let missing = seed_account(&db, server.id, |a| {
            a.remote_uuid = "u-gone".into();
            a.remote_email = "gone@x".into();
        })
        .await;

        let flagged =
            flag_accounts_missing_remotely(&db, server.id, &["u-here".to_string()])
                .await
                .unwrap();
        assert_eq!(flagged, 1);

        let fetched = get_account_by_id(&db, missing.id).await.unwrap().unwrap();
        assert!(fetched.needs_review);
        assert_eq!(fetched.status, AccountStatus::Active);
        let fetched = get_account_by_id(&db, present.id).await.unwrap().unwrap();
        assert!(!fetched.needs_review);
    }

    #[tokio::test]
    async fn renewal_resets_usage_and_warning_state() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;
        let account = seed_account(&db, server.id, |a| {
            a.status = AccountStatus::Suspended;
            a.traffic_limit_bytes = 5 * GIB;
            a.used_bytes = 6 * GIB;
            a.last_warned_percent = Some(95);
        })
        .await;

        let new_expiry = Utc::now() + Duration::days(30);
        let renewed = renew_account(&db, account.id, Some(new_expiry)).await.unwrap();
        assert_eq!(renewed.status, AccountStatus::Active);
        assert_eq!(renewed.used_bytes, 0);
        assert_eq!(renewed.last_warned_percent, None);
        assert_eq!(renewed.expires_at, Some(new_expiry));
    }

    #[tokio::test]
    async fn cancelled_is_terminal() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;
        let account = seed_account(&db, server.id, |_| {}).await;

        let cancelled = cancel_account(&db, account.id).await.unwrap();
        assert_eq!(cancelled.status, AccountStatus::Cancelled);

        // Idempotent cancel, renewal rejected.
        let again = cancel_account(&db, account.id).await.unwrap();
        assert_eq!(again.status, AccountStatus::Cancelled);
        assert!(renew_account(&db, account.id, None).await.is_err());
    }

    #[tokio::test]
    async fn single_suspension_is_status_predicated() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;
        let account = seed_account(&db, server.id, |a| {
            a.status = AccountStatus::Expired;
        })
        .await;

        // The sweep lost the race against an expiry transition: no-op.
        assert_eq!(suspend_account(&db, account.id).await.unwrap(), 0);
        let fetched = get_account_by_id(&db, account.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, AccountStatus::Expired);
    }
}
