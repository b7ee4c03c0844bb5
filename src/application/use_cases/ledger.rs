use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::instrument;
use uuid::Uuid;

use crate::app_error::AppResult;
use crate::domain::entities::ledger_entry_kind::LedgerEntryKind;

pub const DEFAULT_LEDGER_PAGE: i64 = 50;
pub const MAX_LEDGER_PAGE: i64 = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryProfile {
    pub id: Uuid,
    pub user_id: String,
    pub subscription_id: Uuid,
    /// Positive for grants, negative for consumption.
    pub amount: i64,
    #[serde(rename = "type")]
    pub kind: LedgerEntryKind,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
    pub prev_balance: i64,
    pub next_balance: i64,
    pub meta: JsonValue,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// A balance mutation together with the ledger row that records it.
///
/// Committed atomically: the ledger row is only written if the subscription
/// balance still equals `prev_balance`.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange {
    pub subscription_id: Uuid,
    pub user_id: String,
    pub kind: LedgerEntryKind,
    pub amount: i64,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
    pub prev_balance: i64,
    pub next_balance: i64,
}

impl BalanceChange {
    /// `magnitude` is unsigned; the stored amount takes the sign of `kind`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscription_id: Uuid,
        user_id: &str,
        kind: LedgerEntryKind,
        magnitude: i64,
        reason: Option<&str>,
        idempotency_key: Option<&str>,
        prev_balance: i64,
        next_balance: i64,
    ) -> Self {
        Self {
            subscription_id,
            user_id: user_id.to_string(),
            kind,
            amount: kind.sign() * magnitude.abs(),
            reason: reason.map(str::to_string),
            idempotency_key: idempotency_key.map(str::to_string),
            prev_balance,
            next_balance,
        }
    }

    /// Grants also advance the subscription's grant cursor.
    pub fn advances_cursor(&self) -> bool {
        self.kind == LedgerEntryKind::Grant && self.idempotency_key.is_some()
    }

    pub fn meta(&self) -> JsonValue {
        json!({ "prev": self.prev_balance, "next": self.next_balance })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Committed(LedgerEntryProfile),
    /// A ledger row with the same idempotency key already exists.
    DuplicateKey,
    /// The subscription balance moved since it was read.
    StaleBalance,
}

/// Disagreement between a cached balance and the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDrift {
    pub subscription_id: Uuid,
    pub user_id: String,
    pub cached_balance: i64,
    pub ledger_balance: i64,
}

impl BalanceDrift {
    pub fn drift(&self) -> i64 {
        self.cached_balance - self.ledger_balance
    }
}

#[async_trait]
pub trait LedgerRepo: Send + Sync {
    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<LedgerEntryProfile>>;
    async fn commit_balance_change(&self, change: &BalanceChange) -> AppResult<CommitResult>;
    /// Newest first.
    async fn list_for_user(&self, user_id: &str, limit: i64) -> AppResult<Vec<LedgerEntryProfile>>;
    /// Subscriptions whose cached balance differs from the sum of their
    /// ledger deltas.
    async fn find_balance_drift(&self, limit: i64) -> AppResult<Vec<BalanceDrift>>;
}

#[derive(Clone)]
pub struct LedgerUseCases {
    repo: Arc<dyn LedgerRepo>,
}

impl LedgerUseCases {
    pub fn new(repo: Arc<dyn LedgerRepo>) -> Self {
        Self { repo }
    }

    pub async fn list_for_user(&self, user_id: &str, limit: Option<i64>) -> AppResult<Vec<LedgerEntryProfile>> {
        let limit = limit.unwrap_or(DEFAULT_LEDGER_PAGE).clamp(1, MAX_LEDGER_PAGE);
        self.repo.list_for_user(user_id, limit).await
    }

    /// Report subscriptions whose cached balance no longer matches the ledger.
    /// Read-only: drift is logged, never corrected here.
    #[instrument(skip(self))]
    pub async fn audit_balances(&self, limit: i64) -> AppResult<Vec<BalanceDrift>> {
        let drifts = self.repo.find_balance_drift(limit.max(1)).await?;
        for drift in &drifts {
            tracing::warn!(
                subscription_id = %drift.subscription_id,
                user_id = %drift.user_id,
                cached_balance = drift.cached_balance,
                ledger_balance = drift.ledger_balance,
                drift = drift.drift(),
                "Credit balance drifted from ledger"
            );
        }
        if drifts.is_empty() {
            tracing::debug!("Credit balances match ledger");
        }
        Ok(drifts)
    }
}
