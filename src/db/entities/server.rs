use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::{PanelKind, ServerStatus};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "servers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub host: String,
    pub mgmt_port: i32,
    /// Panels are commonly deployed under a secret URL prefix.
    pub web_base_path: Option<String>,
    pub username: String,
    pub password: String,
    pub panel_kind: PanelKind,
    pub status: ServerStatus,
    pub max_users: i32,
    pub current_users: i32,
    pub consecutive_health_failures: i32,
    pub last_synced_at: Option<ChronoDateTimeUtc>,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::account::Entity")]
    Account,
    #[sea_orm(has_many = "super::traffic_sample::Entity")]
    TrafficSample,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl Related<super::traffic_sample::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TrafficSample.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Derived flag: only `active` servers accept new placements.
    pub fn is_active(&self) -> bool {
        self.status == ServerStatus::Active
    }

    /// Management API base URL, including the optional path prefix.
    pub fn panel_base_url(&self) -> String {
        let prefix = self
            .web_base_path
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("/{p}"))
            .unwrap_or_default();
        format!("http://{}:{}{}", self.host, self.mgmt_port, prefix)
    }
}
