use std::env;
use std::str::FromStr;

/// Runtime configuration for the engine, sourced from the environment.
/// `DATABASE_URL` is required; every numeric knob has a default.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub database_url: String,
    pub fleet_sync_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub metrics_retention_days: i64,
    pub health_failure_threshold: i32,
    pub sync_concurrency: usize,
    pub panel_timeout_secs: u64,
    pub notify_webhook_url: Option<String>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        Ok(EngineConfig {
            database_url,
            fleet_sync_interval_secs: parse_or("FLEET_SYNC_INTERVAL_SECS", 300)?,
            metrics_interval_secs: parse_or("METRICS_INTERVAL_SECS", 60)?,
            sweep_interval_secs: parse_or("SWEEP_INTERVAL_SECS", 3600)?,
            cleanup_interval_secs: parse_or("CLEANUP_INTERVAL_SECS", 86400)?,
            metrics_retention_days: parse_or("METRICS_RETENTION_DAYS", 30)?,
            health_failure_threshold: parse_or("HEALTH_FAILURE_THRESHOLD", 3)?,
            sync_concurrency: parse_or("SYNC_CONCURRENCY", 8)?,
            panel_timeout_secs: parse_or("PANEL_TIMEOUT_SECS", 15)?,
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
        })
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, String> {
    raw.parse()
        .map_err(|_| format!("{key} has invalid value '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_value_accepts_numbers_and_rejects_garbage() {
        assert_eq!(parse_value::<u64>("X", "120").unwrap(), 120);
        assert_eq!(parse_value::<i32>("X", "-1").unwrap(), -1);
        let err = parse_value::<u64>("SYNC_CONCURRENCY", "lots").unwrap_err();
        assert!(err.contains("SYNC_CONCURRENCY"));
        assert!(err.contains("lots"));
    }
}
