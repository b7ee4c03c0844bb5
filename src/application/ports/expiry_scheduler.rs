use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::app_error::AppResult;

/// A deferred entitlement re-check ahead of a billing period's end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryCheck {
    pub user_id: String,
    pub provider_subscription_id: String,
    pub current_period_end: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
}

impl ExpiryCheck {
    /// One check per subscription and period, however often the period is
    /// reported.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}",
            self.provider_subscription_id,
            self.current_period_end.timestamp_millis()
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledExpiryCheck {
    pub id: Uuid,
    pub check: ExpiryCheck,
}

/// Durable timer: persists checks so they survive restarts.
#[async_trait]
pub trait ExpiryScheduler: Send + Sync {
    /// Returns `false` when the same check was already scheduled.
    async fn schedule(&self, check: &ExpiryCheck) -> AppResult<bool>;
}

#[async_trait]
pub trait ExpiryCheckQueue: Send + Sync {
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<ScheduledExpiryCheck>>;

    async fn mark_completed(&self, id: Uuid) -> AppResult<()>;

    /// Put a claimed check back so a later poll retries it.
    async fn release(&self, id: Uuid) -> AppResult<()>;
}
