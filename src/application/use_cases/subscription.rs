use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::instrument;
use uuid::Uuid;

use crate::app_error::AppResult;
use crate::use_cases::entitlement::EntitlementPolicy;

/// Status stored when a billing event carries none.
pub const FALLBACK_STATUS: &str = "updated";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionProfile {
    pub id: Uuid,
    pub user_id: String,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub status: String,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub trial_ends_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub cancel_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub canceled_at: Option<DateTime<Utc>>,
    pub product_id: Option<String>,
    pub price_id: Option<String>,
    pub plan_code: Option<String>,
    pub seats: Option<i32>,
    pub metadata: Option<JsonValue>,
    pub credits_grant_per_period: i64,
    pub credits_rollover_limit: i64,
    pub credits_balance: i64,
    pub last_grant_cursor: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Normalized provider fields. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFields {
    #[serde(default)]
    pub provider_customer_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub trial_ends_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub cancel_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub price_id: Option<String>,
    #[serde(default)]
    pub plan_code: Option<String>,
    #[serde(default)]
    pub seats: Option<i32>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub credits_grant_per_period: Option<i64>,
    #[serde(default)]
    pub credits_rollover_limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpsert {
    pub user_id: String,
    pub provider_subscription_id: String,
    #[serde(flatten)]
    pub fields: SubscriptionFields,
}

/// A record to insert. Balance always starts at zero.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: String,
    pub provider_subscription_id: String,
    pub status: String,
    pub fields: SubscriptionFields,
    pub credits_grant_per_period: i64,
    pub credits_rollover_limit: i64,
    /// Record that currently holds the provider id and gives it up in the same write.
    pub detach_from: Option<Uuid>,
}

/// An in-place update. Never touches `credits_balance` or `last_grant_cursor`.
#[derive(Debug, Clone)]
pub struct SubscriptionPatch {
    pub provider_subscription_id: String,
    pub fields: SubscriptionFields,
    pub credits_grant_per_period: i64,
    pub credits_rollover_limit: i64,
    /// Record that currently holds the provider id and gives it up in the same write.
    pub detach_from: Option<Uuid>,
}

#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<SubscriptionProfile>>;
    async fn get_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> AppResult<Option<SubscriptionProfile>>;
    /// Most recently updated record for the user.
    async fn get_latest_for_user(&self, user_id: &str) -> AppResult<Option<SubscriptionProfile>>;
    async fn list_for_user(&self, user_id: &str) -> AppResult<Vec<SubscriptionProfile>>;
    /// Detaching `detach_from` and the write commit together or not at all.
    async fn insert(&self, input: &NewSubscription) -> AppResult<SubscriptionProfile>;
    /// Same all-or-nothing contract as `insert`.
    async fn patch(&self, id: Uuid, patch: &SubscriptionPatch) -> AppResult<SubscriptionProfile>;
}

#[derive(Clone)]
pub struct SubscriptionUseCases {
    repo: Arc<dyn SubscriptionRepo>,
    policy: Arc<EntitlementPolicy>,
}

impl SubscriptionUseCases {
    pub fn new(repo: Arc<dyn SubscriptionRepo>, policy: Arc<EntitlementPolicy>) -> Self {
        Self { repo, policy }
    }

    pub fn policy(&self) -> &EntitlementPolicy {
        &self.policy
    }

    /// Persist a provider-reported subscription for `user_id`.
    ///
    /// Balance and grant cursor stick to the user: whichever branch is taken,
    /// an existing record of the user keeps both, and a provider id that moves
    /// between users is detached from its previous owner instead of carrying
    /// that owner's credits along.
    #[instrument(skip(self, input), fields(user_id = %input.user_id, provider_subscription_id = %input.provider_subscription_id))]
    pub async fn upsert_from_polar(&self, input: &SubscriptionUpsert) -> AppResult<SubscriptionProfile> {
        let user_id = input.user_id.as_str();
        let provider_id = input.provider_subscription_id.as_str();
        let mut fields = input.fields.clone();
        fields.status = fields
            .status
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let by_provider = self.repo.get_by_provider_subscription_id(provider_id).await?;
        let by_user = self.repo.get_latest_for_user(user_id).await?;

        let grant_per_period = fields
            .credits_grant_per_period
            .or(by_provider.as_ref().map(|s| s.credits_grant_per_period))
            .or(by_user.as_ref().map(|s| s.credits_grant_per_period))
            .unwrap_or(self.policy.default_grant_per_period);
        let rollover_limit = fields
            .credits_rollover_limit
            .or(by_provider.as_ref().map(|s| s.credits_rollover_limit))
            .or(by_user.as_ref().map(|s| s.credits_rollover_limit))
            .unwrap_or(self.policy.default_rollover_limit);

        let (target, detach_from) = match by_provider {
            Some(existing) if existing.user_id == user_id => {
                tracing::debug!(subscription_id = %existing.id, "Patching subscription matched by provider id");
                (Some(existing.id), None)
            }
            Some(existing) => {
                tracing::info!(
                    subscription_id = %existing.id,
                    previous_user_id = %existing.user_id,
                    "Provider subscription moved to another user, detaching previous record"
                );
                (by_user.map(|s| s.id), Some(existing.id))
            }
            None => (by_user.map(|s| s.id), None),
        };

        match target {
            Some(id) => {
                self.repo
                    .patch(
                        id,
                        &SubscriptionPatch {
                            provider_subscription_id: provider_id.to_string(),
                            fields,
                            credits_grant_per_period: grant_per_period,
                            credits_rollover_limit: rollover_limit,
                            detach_from,
                        },
                    )
                    .await
            }
            None => {
                tracing::info!("Creating subscription record");
                let status = fields
                    .status
                    .clone()
                    .unwrap_or_else(|| FALLBACK_STATUS.to_string());
                self.repo
                    .insert(&NewSubscription {
                        user_id: user_id.to_string(),
                        provider_subscription_id: provider_id.to_string(),
                        status,
                        fields,
                        credits_grant_per_period: grant_per_period,
                        credits_rollover_limit: rollover_limit,
                        detach_from,
                    })
                    .await
            }
        }
    }

    pub async fn has_entitlement(&self, user_id: &str) -> AppResult<bool> {
        self.has_entitlement_at(user_id, Utc::now()).await
    }

    pub async fn has_entitlement_at(&self, user_id: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let subscriptions = self.repo.list_for_user(user_id).await?;
        Ok(self.policy.has_entitlement(&subscriptions, now))
    }

    /// Zero for users who never subscribed.
    pub async fn get_credit_balance(&self, user_id: &str) -> AppResult<i64> {
        Ok(self
            .repo
            .get_latest_for_user(user_id)
            .await?
            .map(|s| s.credits_balance)
            .unwrap_or(0))
    }

    pub async fn get_subscription_for_user(&self, user_id: &str) -> AppResult<Option<SubscriptionProfile>> {
        self.repo.get_latest_for_user(user_id).await
    }

    pub async fn get_by_provider_id(&self, provider_subscription_id: &str) -> AppResult<Option<SubscriptionProfile>> {
        self.repo.get_by_provider_subscription_id(provider_subscription_id).await
    }

    pub async fn get_all_for_user(&self, user_id: &str) -> AppResult<Vec<SubscriptionProfile>> {
        self.repo.list_for_user(user_id).await
    }
}
