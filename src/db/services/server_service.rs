use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, Set,
};
use tracing::{info, warn};

use crate::db::entities::server;
use crate::db::enums::{PanelKind, ServerStatus};

// --- Server Service Functions ---

/// Input for admin provisioning of a new panel server.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub host: String,
    pub mgmt_port: i32,
    pub web_base_path: Option<String>,
    pub username: String,
    pub password: String,
    pub panel_kind: PanelKind,
    pub max_users: i32,
}

pub async fn create_server(
    db: &DatabaseConnection,
    input: NewServer,
) -> Result<server::Model, DbErr> {
    let now = Utc::now();
    let new_server = server::ActiveModel {
        name: Set(input.name),
        host: Set(input.host),
        mgmt_port: Set(input.mgmt_port),
        web_base_path: Set(input.web_base_path),
        username: Set(input.username),
        password: Set(input.password),
        panel_kind: Set(input.panel_kind),
        status: Set(ServerStatus::Active),
        max_users: Set(input.max_users),
        current_users: Set(0),
        consecutive_health_failures: Set(0),
        last_synced_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    new_server.insert(db).await
}

pub async fn get_server_by_id(
    db: &DatabaseConnection,
    server_id: i32,
) -> Result<Option<server::Model>, DbErr> {
    server::Entity::find_by_id(server_id).one(db).await
}

/// All servers the sync sweep should visit. Maintenance servers are skipped;
/// offline servers are included so a recovered panel can revive itself.
pub async fn get_syncable_servers(db: &DatabaseConnection) -> Result<Vec<server::Model>, DbErr> {
    server::Entity::find()
        .filter(server::Column::Status.ne(ServerStatus::Maintenance))
        .order_by_asc(server::Column::Id)
        .all(db)
        .await
}

pub async fn get_active_servers(db: &DatabaseConnection) -> Result<Vec<server::Model>, DbErr> {
    server::Entity::find()
        .filter(server::Column::Status.eq(ServerStatus::Active))
        .order_by_asc(server::Column::Id)
        .all(db)
        .await
}

/// Updates `current_users` and derives the capacity side of the server state
/// machine: `active -> overloaded` once the cap is reached, and back again
/// when usage drops. Offline and maintenance states are left alone.
pub async fn update_user_count(
    db: &DatabaseConnection,
    server_id: i32,
    current_users: i32,
) -> Result<server::Model, DbErr> {
    let server_model = server::Entity::find_by_id(server_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("server {} not found", server_id)))?;

    let next_status = match server_model.status {
        ServerStatus::Active if current_users >= server_model.max_users => {
            ServerStatus::Overloaded
        }
        ServerStatus::Overloaded if current_users < server_model.max_users => ServerStatus::Active,
        other => other,
    };

    let mut active_model = server_model.into_active_model();
    active_model.current_users = Set(current_users);
    active_model.status = Set(next_status);
    active_model.updated_at = Set(Utc::now());
    active_model.update(db).await
}

/// Records a successful sync: resets the health counter, stamps
/// `last_synced_at`, and revives an offline server.
pub async fn record_sync_success(
    db: &DatabaseConnection,
    server_id: i32,
) -> Result<server::Model, DbErr> {
    let server_model = server::Entity::find_by_id(server_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("server {} not found", server_id)))?;

    let revived = server_model.status == ServerStatus::Offline;
    let mut active_model = server_model.into_active_model();
    active_model.consecutive_health_failures = Set(0);
    active_model.last_synced_at = Set(Some(Utc::now()));
    if revived {
        active_model.status = Set(ServerStatus::Active);
    }
    active_model.updated_at = Set(Utc::now());
    let updated = active_model.update(db).await?;

    if revived {
        info!(server_id = server_id, "server back online after successful sync");
    }
    Ok(updated)
}

/// Records a failed sync attempt and applies the health-failure threshold.
/// Only a run of consecutive failures takes a server offline; an overloaded
/// server keeps its status since capacity, not health, is the cause.
/// Returns the new consecutive-failure count.
pub async fn record_sync_failure(
    db: &DatabaseConnection,
    server_id: i32,
    failure_threshold: i32,
) -> Result<i32, DbErr> {
    let server_model = server::Entity::find_by_id(server_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("server {} not found", server_id)))?;

    let failures = server_model.consecutive_health_failures + 1;
    let take_offline =
        failures >= failure_threshold && server_model.status == ServerStatus::Active;

    let mut active_model = server_model.into_active_model();
    active_model.consecutive_health_failures = Set(failures);
    if take_offline {
        active_model.status = Set(ServerStatus::Offline);
    }
    active_model.updated_at = Set(Utc::now());
    active_model.update(db).await?;

    if take_offline {
        warn!(
            server_id = server_id,
            failures = failures,
            "health-failure threshold crossed, marking server offline"
        );
    }
    Ok(failures)
}

/// Explicit admin status override (e.g. entering or leaving maintenance).
pub async fn set_server_status(
    db: &DatabaseConnection,
    server_id: i32,
    status: ServerStatus,
) -> Result<server::Model, DbErr> {
    let server_model = server::Entity::find_by_id(server_id)
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("server {} not found", server_id)))?;

    let mut active_model = server_model.into_active_model();
    active_model.status = Set(status);
    active_model.updated_at = Set(Utc::now());
    active_model.update(db).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seed_server, setup_db};

    #[tokio::test]
    async fn user_count_at_capacity_marks_overloaded() {
        let db = setup_db().await;
        let server = seed_server(&db, |s| s.max_users = 10).await;

        let updated = update_user_count(&db, server.id, 10).await.unwrap();
        assert_eq!(updated.status, ServerStatus::Overloaded);
        assert_eq!(updated.current_users, 10);

        // Capacity transitions are reversible.
        let updated = update_user_count(&db, server.id, 7).await.unwrap();
        assert_eq!(updated.status, ServerStatus::Active);
    }

    #[tokio::test]
    async fn user_count_does_not_touch_offline_servers() {
        let db = setup_db().await;
        let server = seed_server(&db, |s| {
            s.max_users = 5;
            s.status = ServerStatus::Offline;
        })
        .await;

        let updated = update_user_count(&db, server.id, 5).await.unwrap();
        assert_eq!(updated.status, ServerStatus::Offline);
    }

    #[tokio::test]
    async fn threshold_of_consecutive_failures_takes_server_offline() {
        let db = setup_db().await;
        let server = seed_server(&db, |_| {}).await;

        assert_eq!(record_sync_failure(&db, server.id, 3).await.unwrap(), 1);
        assert_eq!(record_sync_failure(&db, server.id, 3).await.unwrap(), 2);
        let fetched = get_server_by_id(&db, server.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ServerStatus::Active);

        assert_eq!(record_sync_failure(&db, server.id, 3).await.unwrap(), 3);
        let fetched = get_server_by_id(&db, server.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ServerStatus::Offline);
    }

    #[tokio::test]
    async fn success_resets_counter_and_revives_offline_server() {
        let db = setup_db().await;
        let server = seed_server(&db, |s| {
            s.status = ServerStatus::Offline;
            s.consecutive_health_failures = 5;
        })
        .await;

        let updated = record_sync_success(&db, server.id).await.unwrap();
        assert_eq!(updated.status, ServerStatus::Active);
        assert_eq!(updated.consecutive_health_failures, 0);
        assert!(updated.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn failures_preserve_overloaded_status() {
        let db = setup_db().await;
        let server = seed_server(&db, |s| {
            s.status = ServerStatus::Overloaded;
            s.current_users = 10;
            s.max_users = 10;
        })
        .await;

        for _ in 0..4 {
            record_sync_failure(&db, server.id, 3).await.unwrap();
        }
        let fetched = get_server_by_id(&db, server.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ServerStatus::Overloaded);
    }

    #[tokio::test]
    async fn syncable_servers_skip_maintenance() {
        let db = setup_db().await;
        seed_server(&db, |s| s.name = "a".into()).await;
        seed_server(&db, |s| {
            s.name = "b".into();
            s.status = ServerStatus::Maintenance;
        })
        .await;
        seed_server(&db, |s| {
            s.name = "c".into();
            s.status = ServerStatus::Offline;
        })
        .await;

        let syncable = get_syncable_servers(&db).await.unwrap();
        let names: Vec<_> = syncable.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
