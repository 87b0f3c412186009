use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::AccountStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub server_id: i32,
    pub remote_uuid: String,
    pub inbound_id: i64,
    pub remote_email: String,
    pub status: AccountStatus,
    /// 0 = unlimited.
    pub traffic_limit_bytes: i64,
    pub used_bytes: i64,
    /// NULL = never expires.
    pub expires_at: Option<ChronoDateTimeUtc>,
    /// Highest warning-ladder percentage already notified for the current cycle.
    pub last_warned_percent: Option<i16>,
    /// Set when reconciliation finds a discrepancy an operator must resolve.
    pub needs_review: bool,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::server::Entity",
        from = "Column::ServerId",
        to = "super::server::Column::Id"
    )]
    Server,
    #[sea_orm(has_many = "super::traffic_sample::Entity")]
    TrafficSample,
}

impl Related<super::server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Server.def()
    }
}

impl Related<super::traffic_sample::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TrafficSample.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn has_traffic_limit(&self) -> bool {
        self.traffic_limit_bytes > 0
    }

    pub fn has_exceeded_traffic_limit(&self) -> bool {
        self.has_traffic_limit() && self.used_bytes >= self.traffic_limit_bytes
    }

    /// Usage as a percentage of the limit; `None` for unlimited accounts.
    pub fn usage_percent(&self) -> Option<i16> {
        if !self.has_traffic_limit() {
            return None;
        }
        Some(((self.used_bytes as f64 / self.traffic_limit_bytes as f64) * 100.0) as i16)
    }
}
