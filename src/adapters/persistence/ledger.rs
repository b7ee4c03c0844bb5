use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    domain::entities::ledger_entry_kind::LedgerEntryKind,
    use_cases::ledger::{BalanceChange, BalanceDrift, CommitResult, LedgerEntryProfile, LedgerRepo},
};

const SELECT_COLS: &str = r#"
    id, user_id, subscription_id, amount, kind, reason, idempotency_key,
    prev_balance, next_balance, meta, created_at
"#;

fn row_to_entry(row: &sqlx::postgres::PgRow) -> LedgerEntryProfile {
    LedgerEntryProfile {
        id: row.get("id"),
        user_id: row.get("user_id"),
        subscription_id: row.get("subscription_id"),
        amount: row.get("amount"),
        kind: row.get::<LedgerEntryKind, _>("kind"),
        reason: row.get("reason"),
        idempotency_key: row.get("idempotency_key"),
        prev_balance: row.get("prev_balance"),
        next_balance: row.get("next_balance"),
        meta: row.get("meta"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl LedgerRepo for PostgresPersistence {
    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<LedgerEntryProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credit_ledger WHERE idempotency_key = $1",
            SELECT_COLS
        ))
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_entry))
    }

    /// Ledger insert and balance compare-and-swap in one transaction. The
    /// unique index on `idempotency_key` serializes concurrent inserts of the
    /// same key; the loser sees `DuplicateKey` once the winner commits.
    async fn commit_balance_change(&self, change: &BalanceChange) -> AppResult<CommitResult> {
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO credit_ledger (
                id, user_id, subscription_id, amount, kind, reason, idempotency_key,
                prev_balance, next_balance, meta
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(Uuid::new_v4())
        .bind(&change.user_id)
        .bind(change.subscription_id)
        .bind(change.amount)
        .bind(change.kind)
        .bind(&change.reason)
        .bind(&change.idempotency_key)
        .bind(change.prev_balance)
        .bind(change.next_balance)
        .bind(change.meta())
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let Some(row) = inserted else {
            tx.rollback().await.map_err(AppError::from)?;
            return Ok(CommitResult::DuplicateKey);
        };

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions SET
                credits_balance = $3,
                last_grant_cursor = CASE WHEN $4 THEN $5 ELSE last_grant_cursor END,
                updated_at = NOW()
            WHERE id = $1 AND credits_balance = $2
            "#,
        )
        .bind(change.subscription_id)
        .bind(change.prev_balance)
        .bind(change.next_balance)
        .bind(change.advances_cursor())
        .bind(&change.idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(AppError::from)?;
            return Ok(CommitResult::StaleBalance);
        }

        tx.commit().await.map_err(AppError::from)?;
        Ok(CommitResult::Committed(row_to_entry(&row)))
    }

    async fn list_for_user(&self, user_id: &str, limit: i64) -> AppResult<Vec<LedgerEntryProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM credit_ledger WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
            SELECT_COLS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_entry).collect())
    }

    async fn find_balance_drift(&self, limit: i64) -> AppResult<Vec<BalanceDrift>> {
        let rows = sqlx::query(
            r#"
            SELECT
                s.id AS subscription_id,
                s.user_id,
                s.credits_balance AS cached_balance,
                COALESCE(SUM(l.next_balance - l.prev_balance), 0)::BIGINT AS ledger_balance
            FROM subscriptions s
            LEFT JOIN credit_ledger l ON l.subscription_id = s.id
            GROUP BY s.id
            HAVING s.credits_balance <> COALESCE(SUM(l.next_balance - l.prev_balance), 0)
            ORDER BY s.id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows
            .iter()
            .map(|row| BalanceDrift {
                subscription_id: row.get("subscription_id"),
                user_id: row.get("user_id"),
                cached_balance: row.get("cached_balance"),
                ledger_balance: row.get("ledger_balance"),
            })
            .collect())
    }
}
