use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Point-in-time traffic snapshot. Append-only; rows are pruned by the
/// retention job, never updated.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "traffic_samples")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub server_id: i32,
    /// NULL for server-level samples.
    pub account_id: Option<i32>,
    pub upload_bytes: i64,
    pub download_bytes: i64,
    pub sampled_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::server::Entity",
        from = "Column::ServerId",
        to = "super::server::Column::Id"
    )]
    Server,
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::AccountId",
        to = "super::account::Column::Id"
    )]
    Account,
}

impl Related<super::server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Server.def()
    }
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
