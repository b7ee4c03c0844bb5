//! In-memory outbox and expiry scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    domain::entities::billing_event::BillingEvent,
    ports::{
        event_publisher::{EventPublisher, OutboxMessage, OutboxRepo},
        expiry_scheduler::{ExpiryCheck, ExpiryCheckQueue, ExpiryScheduler, ScheduledExpiryCheck},
    },
};

// ============================================================================
// InMemoryOutbox
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Pending,
    Delivered,
    Abandoned,
}

struct OutboxRow {
    event: BillingEvent,
    message: OutboxMessage,
    state: OutboxState,
    next_attempt_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryOutbox {
    rows: Mutex<Vec<OutboxRow>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event ever enqueued, in order.
    pub fn events(&self) -> Vec<BillingEvent> {
        self.rows.lock().unwrap().iter().map(|r| r.event.clone()).collect()
    }

    pub fn message_ids(&self) -> Vec<Uuid> {
        self.rows.lock().unwrap().iter().map(|r| r.message.id).collect()
    }

    pub fn state_of(&self, id: Uuid) -> Option<OutboxState> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.message.id == id)
            .map(|r| r.state)
    }

    pub fn attempts_of(&self, id: Uuid) -> Option<i32> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.message.id == id)
            .map(|r| r.message.attempt_count)
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut OutboxRow)) -> AppResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.message.id == id)
            .ok_or(AppError::NotFound)?;
        f(row);
        row.locked_at = None;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for InMemoryOutbox {
    async fn publish(&self, event: &BillingEvent) -> AppResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        if rows
            .iter()
            .any(|r| r.message.idempotency_id == event.idempotency_id)
        {
            return Ok(false);
        }
        let now = Utc::now();
        rows.push(OutboxRow {
            event: event.clone(),
            message: OutboxMessage {
                id: Uuid::new_v4(),
                event_name: event.name.as_str().to_string(),
                idempotency_id: event.idempotency_id.clone(),
                payload: event.payload.clone(),
                attempt_count: 0,
                created_at: now,
            },
            state: OutboxState::Pending,
            next_attempt_at: now,
            locked_at: None,
        });
        Ok(true)
    }
}

#[async_trait]
impl OutboxRepo for InMemoryOutbox {
    async fn claim_pending_batch(&self, limit: i64) -> AppResult<Vec<OutboxMessage>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        Ok(rows
            .iter_mut()
            .filter(|r| r.state == OutboxState::Pending && r.locked_at.is_none() && r.next_attempt_at <= now)
            .take(limit.max(0) as usize)
            .map(|r| {
                r.locked_at = Some(now);
                r.message.clone()
            })
            .collect())
    }

    async fn mark_delivered(&self, id: Uuid) -> AppResult<()> {
        self.update(id, |r| {
            r.message.attempt_count += 1;
            r.state = OutboxState::Delivered;
        })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
        _error: &str,
    ) -> AppResult<()> {
        self.update(id, |r| {
            r.message.attempt_count = attempt_count;
            r.next_attempt_at = next_attempt_at;
        })
    }

    async fn mark_abandoned(&self, id: Uuid, attempt_count: i32, _error: &str) -> AppResult<()> {
        self.update(id, |r| {
            r.message.attempt_count = attempt_count;
            r.state = OutboxState::Abandoned;
        })
    }

    async fn release_stale(&self, threshold_secs: i64) -> AppResult<i64> {
        let cutoff = Utc::now() - Duration::seconds(threshold_secs);
        let mut released = 0;
        for row in self.rows.lock().unwrap().iter_mut() {
            if row.locked_at.is_some_and(|at| at < cutoff) {
                row.locked_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

/// Publisher whose store is down.
#[derive(Default)]
pub struct FailingEventPublisher;

#[async_trait]
impl EventPublisher for FailingEventPublisher {
    async fn publish(&self, _event: &BillingEvent) -> AppResult<bool> {
        Err(AppError::Database("outbox unavailable".into()))
    }
}

/// Outbox whose first `n` publishes fail, as if the store dropped out mid-run.
pub struct FlakyEventPublisher {
    inner: Arc<InMemoryOutbox>,
    failures_left: AtomicUsize,
}

impl FlakyEventPublisher {
    pub fn new(inner: Arc<InMemoryOutbox>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl EventPublisher for FlakyEventPublisher {
    async fn publish(&self, event: &BillingEvent) -> AppResult<bool> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AppError::Database("outbox unavailable".into()));
        }
        self.inner.publish(event).await
    }
}

// ============================================================================
// InMemoryExpiryScheduler
// ============================================================================

struct ScheduledRow {
    id: Uuid,
    check: ExpiryCheck,
    locked: bool,
    completed: bool,
}

#[derive(Default)]
pub struct InMemoryExpiryScheduler {
    rows: Mutex<Vec<ScheduledRow>>,
}

impl InMemoryExpiryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<ExpiryCheck> {
        self.rows.lock().unwrap().iter().map(|r| r.check.clone()).collect()
    }

    pub fn completed_count(&self) -> usize {
        self.rows.lock().unwrap().iter().filter(|r| r.completed).count()
    }
}

#[async_trait]
impl ExpiryScheduler for InMemoryExpiryScheduler {
    async fn schedule(&self, check: &ExpiryCheck) -> AppResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        let key = check.dedupe_key();
        if rows.iter().any(|r| r.check.dedupe_key() == key) {
            return Ok(false);
        }
        rows.push(ScheduledRow {
            id: Uuid::new_v4(),
            check: check.clone(),
            locked: false,
            completed: false,
        });
        Ok(true)
    }
}

#[async_trait]
impl ExpiryCheckQueue for InMemoryExpiryScheduler {
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<ScheduledExpiryCheck>> {
        let mut rows = self.rows.lock().unwrap();
        Ok(rows
            .iter_mut()
            .filter(|r| !r.locked && !r.completed && r.check.run_at <= now)
            .take(limit.max(0) as usize)
            .map(|r| {
                r.locked = true;
                ScheduledExpiryCheck {
                    id: r.id,
                    check: r.check.clone(),
                }
            })
            .collect())
    }

    async fn mark_completed(&self, id: Uuid) -> AppResult<()> {
        if let Some(row) = self.rows.lock().unwrap().iter_mut().find(|r| r.id == id) {
            row.completed = true;
            row.locked = false;
        }
        Ok(())
    }

    async fn release(&self, id: Uuid) -> AppResult<()> {
        if let Some(row) = self.rows.lock().unwrap().iter_mut().find(|r| r.id == id) {
            row.locked = false;
        }
        Ok(())
    }
}
