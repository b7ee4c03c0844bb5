use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;
use uuid::Uuid;

use crate::app_error::AppResult;
use crate::ports::event_publisher::{OutboxMessage, OutboxRepo};

pub const MAX_DELIVERY_ATTEMPTS: i32 = 8;
const MAX_ERROR_LEN: usize = 1024;

/// Bookkeeping for relaying outbox messages to the event bus.
#[derive(Clone)]
pub struct EventRelayUseCases {
    outbox: Arc<dyn OutboxRepo>,
}

impl EventRelayUseCases {
    pub fn new(outbox: Arc<dyn OutboxRepo>) -> Self {
        Self { outbox }
    }

    pub async fn claim_pending(&self, limit: i64) -> AppResult<Vec<OutboxMessage>> {
        self.outbox.claim_pending_batch(limit).await
    }

    pub async fn record_success(&self, id: Uuid) -> AppResult<()> {
        self.outbox.mark_delivered(id).await
    }

    /// Schedule a retry with backoff, or give up once the attempt budget is
    /// spent or the failure is terminal.
    #[instrument(skip(self, message), fields(message_id = %message.id, event = %message.event_name))]
    pub async fn record_failure(&self, message: &OutboxMessage, error: &str, is_terminal: bool) -> AppResult<()> {
        let attempt_count = message.attempt_count + 1;
        let error = truncate(error, MAX_ERROR_LEN);

        if is_terminal || attempt_count >= MAX_DELIVERY_ATTEMPTS {
            tracing::warn!(attempt_count, error, "Abandoning billing event delivery");
            return self.outbox.mark_abandoned(message.id, attempt_count, error).await;
        }

        let delay = calculate_backoff_delay(attempt_count - 1);
        let next_attempt_at = Utc::now() + chrono::Duration::seconds(delay);
        tracing::debug!(attempt_count, delay_secs = delay, "Billing event delivery failed, will retry");
        self.outbox
            .mark_failed(message.id, attempt_count, next_attempt_at, error)
            .await
    }

    pub async fn release_stale(&self, threshold_secs: i64) -> AppResult<i64> {
        self.outbox.release_stale(threshold_secs).await
    }
}

/// Seconds until the next attempt: 30s growing 4x per attempt, capped at an
/// hour, plus up to 10s jitter.
pub fn calculate_backoff_delay(attempt_count: i32) -> i64 {
    let base_delay: i64 = 30;
    let max_delay: i64 = 3_600;
    let exponential = base_delay.saturating_mul(4i64.saturating_pow(attempt_count.max(0) as u32));
    let capped = exponential.min(max_delay);
    let jitter = (rand::random::<u64>() % 10) as i64;
    capped + jitter
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
