use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::app_error::AppResult;
use crate::domain::entities::billing_event::BillingEvent;

/// At-least-once handoff of billing events to downstream listeners.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Enqueue an event. Returns `false` when an event with the same
    /// idempotency id was already enqueued.
    async fn publish(&self, event: &BillingEvent) -> AppResult<bool>;
}

/// An enqueued event waiting to be relayed to the event bus.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub event_name: String,
    pub idempotency_id: String,
    pub payload: serde_json::Value,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait OutboxRepo: Send + Sync {
    /// Lock and return up to `limit` messages that are due for delivery.
    async fn claim_pending_batch(&self, limit: i64) -> AppResult<Vec<OutboxMessage>>;

    async fn mark_delivered(&self, id: Uuid) -> AppResult<()>;

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<()>;

    async fn mark_abandoned(&self, id: Uuid, attempt_count: i32, error: &str) -> AppResult<()>;

    /// Unlock messages whose claim is older than `threshold_secs`.
    async fn release_stale(&self, threshold_secs: i64) -> AppResult<i64>;
}
