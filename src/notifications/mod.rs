use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

pub mod webhook;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("failed to send notification: {0}")]
    SendFailed(String),
    #[error("invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTarget {
    Account(i32),
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NotificationKind {
    /// A warning-ladder threshold was crossed; at most one per crossing.
    TrafficWarning { percent: i16 },
    TrafficExceeded,
    ServerOffline,
    /// Reconciliation found state an operator must resolve.
    AccountNeedsReview,
    /// A move left an account dual-provisioned; manual cleanup required.
    MoveNeedsReconciliation,
}

/// Seam to the platform's delivery machinery (bot, mail, ...). The engine
/// only emits; rendering and routing live outside.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        target: NotifyTarget,
        kind: NotificationKind,
        payload: Value,
        priority: Priority,
    ) -> Result<(), SenderError>;
}

/// Default sender: structured log lines only. Also the test double.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        target: NotifyTarget,
        kind: NotificationKind,
        payload: Value,
        priority: Priority,
    ) -> Result<(), SenderError> {
        info!(
            target = ?target,
            kind = ?kind,
            priority = ?priority,
            payload = %payload,
            "notification emitted"
        );
        Ok(())
    }
}
