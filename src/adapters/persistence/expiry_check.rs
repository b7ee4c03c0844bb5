use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    ports::expiry_scheduler::{ExpiryCheck, ExpiryCheckQueue, ExpiryScheduler, ScheduledExpiryCheck},
};

/// Claims older than this are considered abandoned by a crashed worker.
const STALE_CLAIM_SECS: f64 = 600.0;

#[async_trait]
impl ExpiryScheduler for PostgresPersistence {
    async fn schedule(&self, check: &ExpiryCheck) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO expiry_checks (id, dedupe_key, user_id, provider_subscription_id, current_period_end, run_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (dedupe_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(check.dedupe_key())
        .bind(&check.user_id)
        .bind(&check.provider_subscription_id)
        .bind(check.current_period_end)
        .bind(check.run_at)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ExpiryCheckQueue for PostgresPersistence {
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> AppResult<Vec<ScheduledExpiryCheck>> {
        let rows = sqlx::query(
            r#"
            UPDATE expiry_checks
            SET locked_at = NOW()
            WHERE id IN (
                SELECT id FROM expiry_checks
                WHERE completed_at IS NULL
                  AND run_at <= $1
                  AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $3))
                ORDER BY run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, user_id, provider_subscription_id, current_period_end, run_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(STALE_CLAIM_SECS)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows
            .iter()
            .map(|row| ScheduledExpiryCheck {
                id: row.get("id"),
                check: ExpiryCheck {
                    user_id: row.get("user_id"),
                    provider_subscription_id: row.get("provider_subscription_id"),
                    current_period_end: row.get("current_period_end"),
                    run_at: row.get("run_at"),
                },
            })
            .collect())
    }

    async fn mark_completed(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE expiry_checks SET completed_at = NOW(), locked_at = NULL WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(())
    }

    async fn release(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE expiry_checks SET locked_at = NULL WHERE id = $1 AND completed_at IS NULL")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(AppError::from)?;
        Ok(())
    }
}
