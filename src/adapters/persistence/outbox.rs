use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    domain::entities::billing_event::BillingEvent,
    ports::event_publisher::{EventPublisher, OutboxMessage, OutboxRepo},
};

fn row_to_message(row: &sqlx::postgres::PgRow) -> OutboxMessage {
    OutboxMessage {
        id: row.get("id"),
        event_name: row.get("event_name"),
        idempotency_id: row.get("idempotency_id"),
        payload: row.get("payload"),
        attempt_count: row.get("attempt_count"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl EventPublisher for PostgresPersistence {
    async fn publish(&self, event: &BillingEvent) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_outbox (id, event_name, idempotency_id, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.name.as_str())
        .bind(&event.idempotency_id)
        .bind(&event.payload)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;

        let enqueued = result.rows_affected() > 0;
        if !enqueued {
            tracing::debug!(idempotency_id = %event.idempotency_id, "Billing event already enqueued");
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl OutboxRepo for PostgresPersistence {
    async fn claim_pending_batch(&self, limit: i64) -> AppResult<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            UPDATE billing_outbox
            SET locked_at = NOW()
            WHERE id IN (
                SELECT id FROM billing_outbox
                WHERE status = 'pending' AND locked_at IS NULL AND next_attempt_at <= NOW()
                ORDER BY next_attempt_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_name, idempotency_id, payload, attempt_count, created_at
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn mark_delivered(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_outbox
            SET status = 'delivered', delivered_at = NOW(), locked_at = NULL,
                attempt_count = attempt_count + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_outbox
            SET attempt_count = $2, next_attempt_at = $3, last_error = $4, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(next_attempt_at)
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn mark_abandoned(&self, id: Uuid, attempt_count: i32, error: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_outbox
            SET status = 'abandoned', attempt_count = $2, last_error = $3, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn release_stale(&self, threshold_secs: i64) -> AppResult<i64> {
        let result = sqlx::query(
            r#"
            UPDATE billing_outbox
            SET locked_at = NULL
            WHERE status = 'pending'
              AND locked_at IS NOT NULL
              AND locked_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(threshold_secs as f64)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected() as i64)
    }
}
