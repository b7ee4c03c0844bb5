use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Events this service publishes to the event bus for downstream listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BillingEventName {
    CreditsGranted,
    SubscriptionSynced,
    PreExpiry,
}

impl BillingEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreditsGranted => "billing/credits.granted",
            Self::SubscriptionSynced => "billing/subscription.synced",
            Self::PreExpiry => "billing/subscription.pre_expiry",
        }
    }
}

impl fmt::Display for BillingEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsGrantedPayload {
    pub user_id: String,
    pub provider_subscription_id: String,
    pub granted: i64,
    pub balance: i64,
    pub reason: String,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSyncedPayload {
    pub user_id: String,
    pub provider_subscription_id: String,
    pub status: String,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreExpiryPayload {
    pub user_id: String,
    pub provider_subscription_id: String,
    pub current_period_end: i64,
}

/// A named event plus the id downstream consumers deduplicate on.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub name: BillingEventName,
    pub idempotency_id: String,
    pub payload: serde_json::Value,
}

impl BillingEvent {
    pub fn credits_granted(grant_key: &str, payload: CreditsGrantedPayload) -> serde_json::Result<Self> {
        Ok(Self {
            name: BillingEventName::CreditsGranted,
            idempotency_id: format!("credits.granted:{}", grant_key),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Keyed by subscription and period: one sync signal per billing period,
    /// whatever status changes the provider reports inside it.
    pub fn subscription_synced(payload: SubscriptionSyncedPayload) -> serde_json::Result<Self> {
        let idempotency_id = format!(
            "subscription.synced:{}:{}",
            payload.provider_subscription_id,
            period_key(payload.current_period_end)
        );
        Ok(Self {
            name: BillingEventName::SubscriptionSynced,
            idempotency_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn pre_expiry(payload: PreExpiryPayload) -> serde_json::Result<Self> {
        let idempotency_id = format!(
            "subscription.pre_expiry:{}:{}",
            payload.provider_subscription_id, payload.current_period_end
        );
        Ok(Self {
            name: BillingEventName::PreExpiry,
            idempotency_id,
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// Epoch milliseconds of a timestamp, the wire format for period boundaries.
pub fn epoch_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn period_key(period_end_ms: Option<i64>) -> String {
    period_end_ms
        .map(|ms| ms.to_string())
        .unwrap_or_else(|| "none".to_string())
}
