//! Shared test plumbing: an in-memory SQLite database with tables created
//! from the entities, plus factory helpers for the common rows.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend, IntoActiveModel,
    NotSet, Schema,
};
use uuid::Uuid;

use crate::db::entities::{account, server, traffic_sample};
use crate::db::enums::{AccountStatus, PanelKind, ServerStatus};

pub async fn setup_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("connect to in-memory sqlite");
    let schema = Schema::new(DbBackend::Sqlite);
    let statements = [
        schema.create_table_from_entity(server::Entity),
        schema.create_table_from_entity(account::Entity),
        schema.create_table_from_entity(traffic_sample::Entity),
    ];
    for statement in statements {
        db.execute(db.get_database_backend().build(&statement))
            .await
            .expect("create table");
    }
    db
}

/// An unsaved server row with sane defaults; `id` is ignored on insert.
pub fn server_model(id: i32, customize: impl FnOnce(&mut server::Model)) -> server::Model {
    let now = Utc::now();
    let mut model = server::Model {
        id,
        name: format!("srv-{id}"),
        host: "198.51.100.7".to_string(),
        mgmt_port: 2053,
        web_base_path: None,
        username: "admin".to_string(),
        password: "admin".to_string(),
        panel_kind: PanelKind::ThreeXui,
        status: ServerStatus::Active,
        max_users: 100,
        current_users: 0,
        consecutive_health_failures: 0,
        last_synced_at: None,
        created_at: now,
        updated_at: now,
    };
    customize(&mut model);
    model
}

pub async fn seed_server(
    db: &DatabaseConnection,
    customize: impl FnOnce(&mut server::Model),
) -> server::Model {
    let mut active_model = server_model(0, customize).into_active_model();
    active_model.id = NotSet;
    active_model.insert(db).await.expect("insert server")
}

pub async fn seed_account(
    db: &DatabaseConnection,
    server_id: i32,
    customize: impl FnOnce(&mut account::Model),
) -> account::Model {
    let now = Utc::now();
    let mut model = account::Model {
        id: 0,
        server_id,
        remote_uuid: Uuid::new_v4().to_string(),
        inbound_id: 1,
        remote_email: "acct@plan".to_string(),
        status: AccountStatus::Active,
        traffic_limit_bytes: 0,
        used_bytes: 0,
        expires_at: None,
        last_warned_percent: None,
        needs_review: false,
        created_at: now,
        updated_at: now,
    };
    customize(&mut model);
    let mut active_model = model.into_active_model();
    active_model.id = NotSet;
    active_model.insert(db).await.expect("insert account")
}
