use async_trait::async_trait;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    use_cases::subscription::{
        NewSubscription, SubscriptionPatch, SubscriptionProfile, SubscriptionRepo,
    },
};

const SELECT_COLS: &str = r#"
    id, user_id, provider_customer_id, provider_subscription_id, status,
    current_period_end, trial_ends_at, cancel_at, canceled_at,
    product_id, price_id, plan_code, seats, metadata,
    credits_grant_per_period, credits_rollover_limit, credits_balance, last_grant_cursor,
    created_at, updated_at
"#;

fn row_to_profile(row: &sqlx::postgres::PgRow) -> SubscriptionProfile {
    SubscriptionProfile {
        id: row.get("id"),
        user_id: row.get("user_id"),
        provider_customer_id: row.get("provider_customer_id"),
        provider_subscription_id: row.get("provider_subscription_id"),
        status: row.get("status"),
        current_period_end: row.get("current_period_end"),
        trial_ends_at: row.get("trial_ends_at"),
        cancel_at: row.get("cancel_at"),
        canceled_at: row.get("canceled_at"),
        product_id: row.get("product_id"),
        price_id: row.get("price_id"),
        plan_code: row.get("plan_code"),
        seats: row.get("seats"),
        metadata: row.get("metadata"),
        credits_grant_per_period: row.get("credits_grant_per_period"),
        credits_rollover_limit: row.get("credits_rollover_limit"),
        credits_balance: row.get("credits_balance"),
        last_grant_cursor: row.get("last_grant_cursor"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl SubscriptionRepo for PostgresPersistence {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<SubscriptionProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SELECT_COLS
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_profile))
    }

    async fn get_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> AppResult<Option<SubscriptionProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE provider_subscription_id = $1",
            SELECT_COLS
        ))
        .bind(provider_subscription_id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_profile))
    }

    async fn get_latest_for_user(&self, user_id: &str) -> AppResult<Option<SubscriptionProfile>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY updated_at DESC, created_at DESC LIMIT 1",
            SELECT_COLS
        ))
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_profile))
    }

    async fn list_for_user(&self, user_id: &str) -> AppResult<Vec<SubscriptionProfile>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY updated_at DESC",
            SELECT_COLS
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_profile).collect())
    }

    async fn insert(&self, input: &NewSubscription) -> AppResult<SubscriptionProfile> {
        let fields = &input.fields;
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;
        detach_provider_subscription_id(&mut tx, input.detach_from).await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, provider_subscription_id, status, provider_customer_id,
                current_period_end, trial_ends_at, cancel_at, canceled_at,
                product_id, price_id, plan_code, seats, metadata,
                credits_grant_per_period, credits_rollover_limit, credits_balance
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 0)
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(Uuid::new_v4())
        .bind(&input.user_id)
        .bind(&input.provider_subscription_id)
        .bind(&input.status)
        .bind(&fields.provider_customer_id)
        .bind(fields.current_period_end)
        .bind(fields.trial_ends_at)
        .bind(fields.cancel_at)
        .bind(fields.canceled_at)
        .bind(&fields.product_id)
        .bind(&fields.price_id)
        .bind(&fields.plan_code)
        .bind(fields.seats)
        .bind(&fields.metadata)
        .bind(input.credits_grant_per_period)
        .bind(input.credits_rollover_limit)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(row_to_profile(&row))
    }

    // NULL parameters keep the stored value; balance and cursor are never written here.
    async fn patch(&self, id: Uuid, patch: &SubscriptionPatch) -> AppResult<SubscriptionProfile> {
        let fields = &patch.fields;
        let mut tx = self.pool().begin().await.map_err(AppError::from)?;
        detach_provider_subscription_id(&mut tx, patch.detach_from).await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE subscriptions SET
                provider_subscription_id = $2,
                provider_customer_id = COALESCE($3, provider_customer_id),
                status = COALESCE($4, status),
                current_period_end = COALESCE($5, current_period_end),
                trial_ends_at = COALESCE($6, trial_ends_at),
                cancel_at = COALESCE($7, cancel_at),
                canceled_at = COALESCE($8, canceled_at),
                product_id = COALESCE($9, product_id),
                price_id = COALESCE($10, price_id),
                plan_code = COALESCE($11, plan_code),
                seats = COALESCE($12, seats),
                metadata = COALESCE($13, metadata),
                credits_grant_per_period = $14,
                credits_rollover_limit = $15,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(id)
        .bind(&patch.provider_subscription_id)
        .bind(&fields.provider_customer_id)
        .bind(&fields.status)
        .bind(fields.current_period_end)
        .bind(fields.trial_ends_at)
        .bind(fields.cancel_at)
        .bind(fields.canceled_at)
        .bind(&fields.product_id)
        .bind(&fields.price_id)
        .bind(&fields.plan_code)
        .bind(fields.seats)
        .bind(&fields.metadata)
        .bind(patch.credits_grant_per_period)
        .bind(patch.credits_rollover_limit)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?;
        let profile = row.as_ref().map(row_to_profile).ok_or(AppError::NotFound)?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(profile)
    }
}

/// Frees a provider id held by another record so the write in the same
/// transaction can claim it under the unique index.
async fn detach_provider_subscription_id(
    tx: &mut Transaction<'_, Postgres>,
    id: Option<Uuid>,
) -> AppResult<()> {
    let Some(id) = id else {
        return Ok(());
    };
    sqlx::query(
        "UPDATE subscriptions SET provider_subscription_id = NULL, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .execute(&mut **tx)
    .await
    .map_err(AppError::from)?;
    Ok(())
}
