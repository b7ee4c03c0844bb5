use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::instrument;
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};
use crate::domain::entities::ledger_entry_kind::LedgerEntryKind;
use crate::use_cases::entitlement::EntitlementPolicy;
use crate::use_cases::ledger::{BalanceChange, CommitResult, LedgerEntryProfile, LedgerRepo};
use crate::use_cases::subscription::SubscriptionRepo;

pub const DEFAULT_CAS_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSkip {
    DuplicateLedger,
    CursorMatch,
    NotEntitled,
    ZeroGrant,
}

impl GrantSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantSkip::DuplicateLedger => "duplicate-ledger",
            GrantSkip::CursorMatch => "cursor-match",
            GrantSkip::NotEntitled => "not-entitled",
            GrantSkip::ZeroGrant => "zero-grant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted { granted: i64, balance: i64 },
    /// Nothing to do. Replays and non-entitled states land here; not an error.
    Skipped(GrantSkip),
    SubscriptionNotFound,
}

impl GrantOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, GrantOutcome::Granted { .. })
    }
}

#[derive(Serialize)]
struct OutcomeBody {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    granted: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    balance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    idempotent: Option<bool>,
}

impl OutcomeBody {
    fn ok(ok: bool) -> Self {
        Self {
            ok,
            granted: None,
            balance: None,
            skipped: None,
            reason: None,
            error: None,
            idempotent: None,
        }
    }
}

/// `{ok, granted?, balance?, skipped?, reason?}`
impl Serialize for GrantOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = match self {
            GrantOutcome::Granted { granted, balance } => OutcomeBody {
                granted: Some(*granted),
                balance: Some(*balance),
                ..OutcomeBody::ok(true)
            },
            GrantOutcome::Skipped(skip) => OutcomeBody {
                skipped: Some(true),
                reason: Some(skip.as_str()),
                ..OutcomeBody::ok(true)
            },
            GrantOutcome::SubscriptionNotFound => OutcomeBody {
                reason: Some("subscription-not-found"),
                ..OutcomeBody::ok(false)
            },
        };
        body.serialize(serializer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeError {
    InvalidAmount,
    NoSubscription,
    NotEntitled,
    InsufficientBalance { balance: i64 },
}

impl ConsumeError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumeError::InvalidAmount => "invalid-amount",
            ConsumeError::NoSubscription => "no-subscription",
            ConsumeError::NotEntitled => "not-entitled",
            ConsumeError::InsufficientBalance { .. } => "insufficient-balance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed { balance: i64 },
    /// The idempotency key was already used; nothing was deducted.
    Idempotent,
    Rejected(ConsumeError),
}

/// `{ok, balance?, error?, idempotent?}`
impl Serialize for ConsumeOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = match self {
            ConsumeOutcome::Consumed { balance } => OutcomeBody {
                balance: Some(*balance),
                ..OutcomeBody::ok(true)
            },
            ConsumeOutcome::Idempotent => OutcomeBody {
                idempotent: Some(true),
                ..OutcomeBody::ok(true)
            },
            ConsumeOutcome::Rejected(err) => OutcomeBody {
                error: Some(err.as_str()),
                balance: match err {
                    ConsumeError::InsufficientBalance { balance } => Some(*balance),
                    _ => None,
                },
                ..OutcomeBody::ok(false)
            },
        };
        body.serialize(serializer)
    }
}

/// Grant and consumption engines. Every balance change is committed together
/// with its ledger row; a concurrent writer causes a re-read and retry.
#[derive(Clone)]
pub struct CreditUseCases {
    subscriptions: Arc<dyn SubscriptionRepo>,
    ledger: Arc<dyn LedgerRepo>,
    policy: Arc<EntitlementPolicy>,
    cas_retries: u32,
}

impl CreditUseCases {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepo>,
        ledger: Arc<dyn LedgerRepo>,
        policy: Arc<EntitlementPolicy>,
        cas_retries: u32,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            policy,
            cas_retries,
        }
    }

    /// Ledger row committed under `idempotency_key`, if any.
    pub async fn find_ledger_entry(&self, idempotency_key: &str) -> AppResult<Option<LedgerEntryProfile>> {
        self.ledger.find_by_idempotency_key(idempotency_key).await
    }

    #[instrument(skip(self))]
    pub async fn grant_credits_if_needed(
        &self,
        subscription_id: Uuid,
        idempotency_key: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> AppResult<GrantOutcome> {
        if self.ledger.find_by_idempotency_key(idempotency_key).await?.is_some() {
            return Ok(GrantOutcome::Skipped(GrantSkip::DuplicateLedger));
        }

        for attempt in 0..=self.cas_retries {
            let Some(subscription) = self.subscriptions.get_by_id(subscription_id).await? else {
                return Ok(GrantOutcome::SubscriptionNotFound);
            };
            if subscription.last_grant_cursor.as_deref() == Some(idempotency_key) {
                return Ok(GrantOutcome::Skipped(GrantSkip::CursorMatch));
            }
            if !self.policy.is_entitled_status(&subscription.status) {
                return Ok(GrantOutcome::Skipped(GrantSkip::NotEntitled));
            }

            let grant = amount.unwrap_or(subscription.credits_grant_per_period);
            if grant <= 0 {
                return Ok(GrantOutcome::Skipped(GrantSkip::ZeroGrant));
            }

            // Capped: credits above the rollover limit are dropped.
            let prev = subscription.credits_balance;
            let next = prev.saturating_add(grant).min(subscription.credits_rollover_limit);

            let change = BalanceChange::new(
                subscription.id,
                &subscription.user_id,
                LedgerEntryKind::Grant,
                grant,
                reason,
                Some(idempotency_key),
                prev,
                next,
            );
            match self.ledger.commit_balance_change(&change).await? {
                CommitResult::Committed(_) => {
                    tracing::info!(
                        subscription_id = %subscription.id,
                        user_id = %subscription.user_id,
                        granted = grant,
                        balance = next,
                        "Granted credits"
                    );
                    return Ok(GrantOutcome::Granted { granted: grant, balance: next });
                }
                CommitResult::DuplicateKey => {
                    return Ok(GrantOutcome::Skipped(GrantSkip::DuplicateLedger));
                }
                CommitResult::StaleBalance => {
                    tracing::debug!(attempt, "Balance changed during grant, retrying");
                }
            }
        }

        Err(AppError::Conflict(format!(
            "balance of subscription {} kept changing during grant",
            subscription_id
        )))
    }

    #[instrument(skip(self))]
    pub async fn consume_credits(
        &self,
        user_id: &str,
        amount: i64,
        reason: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> AppResult<ConsumeOutcome> {
        if amount <= 0 {
            return Ok(ConsumeOutcome::Rejected(ConsumeError::InvalidAmount));
        }
        if let Some(key) = idempotency_key {
            if self.ledger.find_by_idempotency_key(key).await?.is_some() {
                return Ok(ConsumeOutcome::Idempotent);
            }
        }

        for attempt in 0..=self.cas_retries {
            let Some(subscription) = self.subscriptions.get_latest_for_user(user_id).await? else {
                return Ok(ConsumeOutcome::Rejected(ConsumeError::NoSubscription));
            };
            if !self.policy.is_entitled_status(&subscription.status) {
                return Ok(ConsumeOutcome::Rejected(ConsumeError::NotEntitled));
            }
            let balance = subscription.credits_balance;
            if balance < amount {
                return Ok(ConsumeOutcome::Rejected(ConsumeError::InsufficientBalance { balance }));
            }

            let next = balance - amount;
            let change = BalanceChange::new(
                subscription.id,
                user_id,
                LedgerEntryKind::Consume,
                amount,
                reason,
                idempotency_key,
                balance,
                next,
            );
            match self.ledger.commit_balance_change(&change).await? {
                CommitResult::Committed(_) => {
                    tracing::debug!(user_id, amount, balance = next, "Consumed credits");
                    return Ok(ConsumeOutcome::Consumed { balance: next });
                }
                CommitResult::DuplicateKey => return Ok(ConsumeOutcome::Idempotent),
                CommitResult::StaleBalance => {
                    tracing::debug!(attempt, "Balance changed during consumption, retrying");
                }
            }
        }

        Err(AppError::Conflict(format!(
            "balance of user {} kept changing during consumption",
            user_id
        )))
    }
}
