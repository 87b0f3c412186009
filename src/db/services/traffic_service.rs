use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

use crate::db::entities::traffic_sample;

// --- TrafficSample Service Functions ---

/// Appends one immutable traffic snapshot. `account_id` is `None` for
/// server-level samples.
pub async fn insert_sample(
    db: &DatabaseConnection,
    server_id: i32,
    account_id: Option<i32>,
    upload_bytes: i64,
    download_bytes: i64,
    sampled_at: DateTime<Utc>,
) -> Result<traffic_sample::Model, DbErr> {
    let sample = traffic_sample::ActiveModel {
        server_id: Set(server_id),
        account_id: Set(account_id),
        upload_bytes: Set(upload_bytes),
        download_bytes: Set(download_bytes),
        sampled_at: Set(sampled_at),
        ..Default::default()
    };
    sample.insert(db).await
}

pub async fn get_samples_for_server(
    db: &DatabaseConnection,
    server_id: i32,
    since: DateTime<Utc>,
) -> Result<Vec<traffic_sample::Model>, DbErr> {
    traffic_sample::Entity::find()
        .filter(traffic_sample::Column::ServerId.eq(server_id))
        .filter(traffic_sample::Column::SampledAt.gte(since))
        .order_by_asc(traffic_sample::Column::SampledAt)
        .all(db)
        .await
}

pub async fn get_latest_sample_for_server(
    db: &DatabaseConnection,
    server_id: i32,
) -> Result<Option<traffic_sample::Model>, DbErr> {
    traffic_sample::Entity::find()
        .filter(traffic_sample::Column::ServerId.eq(server_id))
        .order_by_desc(traffic_sample::Column::SampledAt)
        .one(db)
        .await
}

/// Retention: deletes samples strictly older than `now - retention_days`.
/// The boundary is exclusive; a sample exactly at the cutoff is retained.
/// Returns rows deleted.
pub async fn cleanup_old_samples(
    db: &DatabaseConnection,
    retention_days: i64,
    now: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let cutoff = now - Duration::days(retention_days);
    let result = traffic_sample::Entity::delete_many()
        .filter(traffic_sample::Column::SampledAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}
