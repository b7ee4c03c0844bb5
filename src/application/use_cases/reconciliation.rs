//! Turns billing-provider webhooks into subscription and ledger state.
//!
//! Every step is safe to re-run: the upsert converges, grants are keyed per
//! billing period, outbound events and expiry checks deduplicate on their own
//! ids. A store failure aborts the run and the whole event is redelivered;
//! steps already committed are not rolled back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::instrument;
use uuid::Uuid;

use crate::app_error::AppResult;
use crate::domain::entities::billing_event::{
    BillingEvent, CreditsGrantedPayload, PreExpiryPayload, SubscriptionSyncedPayload, epoch_ms,
};
use crate::domain::entities::grant_trigger::GrantTrigger;
use crate::domain::entities::ledger_entry_kind::LedgerEntryKind;
use crate::domain::entities::polar_webhook::{BillingEntity, ParsedEvent, SubscriptionPayload};
use crate::helpers::webhook_parsing::{ParseError, parse_raw_event};
use crate::ports::event_publisher::EventPublisher;
use crate::ports::expiry_scheduler::{ExpiryCheck, ExpiryScheduler};
use crate::ports::user_directory::UserDirectory;
use crate::use_cases::credits::{CreditUseCases, GrantOutcome, GrantSkip};
use crate::use_cases::subscription::{
    FALLBACK_STATUS, SubscriptionFields, SubscriptionUpsert, SubscriptionUseCases,
};

#[derive(Debug, Clone)]
pub struct ReconciliationSettings {
    /// Credits granted per entitled webhook, independent of the plan's own setting.
    pub grant_amount: i64,
    pub pre_expiry_lookback: Duration,
    pub pre_expiry_min_delay: Duration,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            grant_amount: 10,
            pre_expiry_lookback: Duration::days(3),
            pre_expiry_min_delay: Duration::seconds(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscardReason {
    MalformedEnvelope,
    UnrecognizedEntity,
    UserUnresolved,
    MissingSubscriptionId,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::MalformedEnvelope => "malformed-envelope",
            DiscardReason::UnrecognizedEntity => "unrecognized-entity",
            DiscardReason::UserUnresolved => "user-unresolved",
            DiscardReason::MissingSubscriptionId => "missing-subscription-id",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub event_id: String,
    pub subscription_id: Uuid,
    pub user_id: String,
    pub provider_subscription_id: String,
    pub status: String,
    /// Absent when the status was not entitled and no grant was attempted.
    pub grant: Option<GrantOutcome>,
    pub expiry_check_scheduled: bool,
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Not actionable; acknowledged without retry.
    Discarded(DiscardReason),
    Synced(SyncReport),
}

/// Idempotency key of the grant for one billing period.
///
/// The period end identifies the period when known; otherwise the event id
/// does, and a subscription with neither gets one first grant.
pub fn grant_key(
    provider_subscription_id: &str,
    current_period_end: Option<DateTime<Utc>>,
    event_id: Option<&str>,
) -> String {
    match (current_period_end, event_id.filter(|id| !id.is_empty())) {
        (Some(period_end), _) => format!("{}:{}", provider_subscription_id, epoch_ms(period_end)),
        (None, Some(event_id)) => format!("{}:evt:{}", provider_subscription_id, event_id),
        (None, None) => format!("{}:first", provider_subscription_id),
    }
}

/// When the pre-expiry re-check should fire, or `None` when the period has
/// already ended.
pub fn expiry_check_run_at(
    current_period_end: DateTime<Utc>,
    now: DateTime<Utc>,
    settings: &ReconciliationSettings,
) -> Option<DateTime<Utc>> {
    if current_period_end <= now {
        return None;
    }
    Some((now + settings.pre_expiry_min_delay).max(current_period_end - settings.pre_expiry_lookback))
}

#[derive(Clone)]
pub struct ReconciliationUseCases {
    subscriptions: SubscriptionUseCases,
    credits: CreditUseCases,
    user_directory: Arc<dyn UserDirectory>,
    publisher: Arc<dyn EventPublisher>,
    scheduler: Arc<dyn ExpiryScheduler>,
    settings: ReconciliationSettings,
}

impl ReconciliationUseCases {
    pub fn new(
        subscriptions: SubscriptionUseCases,
        credits: CreditUseCases,
        user_directory: Arc<dyn UserDirectory>,
        publisher: Arc<dyn EventPublisher>,
        scheduler: Arc<dyn ExpiryScheduler>,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            subscriptions,
            credits,
            user_directory,
            publisher,
            scheduler,
            settings,
        }
    }

    pub async fn handle_event(&self, raw: &JsonValue) -> AppResult<ReconcileOutcome> {
        self.handle_event_at(raw, Utc::now()).await
    }

    #[instrument(skip_all, fields(event_id = tracing::field::Empty, event_type = tracing::field::Empty))]
    pub async fn handle_event_at(&self, raw: &JsonValue, now: DateTime<Utc>) -> AppResult<ReconcileOutcome> {
        let event = match parse_raw_event(raw) {
            Ok(event) => event,
            Err(err) => {
                let reason = match &err {
                    ParseError::MalformedEnvelope(_) => DiscardReason::MalformedEnvelope,
                    ParseError::UnrecognizedEntity { .. } => DiscardReason::UnrecognizedEntity,
                };
                tracing::info!(error = %err, reason = reason.as_str(), "Discarding billing webhook");
                return Ok(ReconcileOutcome::Discarded(reason));
            }
        };
        let span = tracing::Span::current();
        span.record("event_id", event.id.as_str());
        span.record("event_type", event.event_type.as_str());

        let Some(user_id) = self.resolve_user(&event).await? else {
            return Ok(discard(DiscardReason::UserUnresolved));
        };
        let Some(provider_subscription_id) = provider_subscription_id(&event.entity) else {
            return Ok(discard(DiscardReason::MissingSubscriptionId));
        };

        let fields = normalize(&event.entity);
        let period_end = fields.current_period_end;
        let profile = self
            .subscriptions
            .upsert_from_polar(&SubscriptionUpsert {
                user_id: user_id.clone(),
                provider_subscription_id: provider_subscription_id.clone(),
                fields,
            })
            .await?;

        let key = grant_key(&provider_subscription_id, period_end, Some(&event.id));
        let grant = if self.subscriptions.policy().is_entitled_status(&profile.status) {
            let trigger = GrantTrigger::from_event_type(&event.event_type);
            let outcome = self
                .credits
                .grant_credits_if_needed(profile.id, &key, Some(self.settings.grant_amount), Some(trigger.reason()))
                .await?;
            let committed = match &outcome {
                GrantOutcome::Granted { granted, balance } => {
                    Some((*granted, *balance, trigger.reason().to_string()))
                }
                // An earlier run may have committed this grant and failed before publishing.
                GrantOutcome::Skipped(GrantSkip::DuplicateLedger | GrantSkip::CursorMatch) => self
                    .credits
                    .find_ledger_entry(&key)
                    .await?
                    .filter(|entry| entry.kind == LedgerEntryKind::Grant && entry.subscription_id == profile.id)
                    .map(|entry| {
                        let reason = entry.reason.unwrap_or_else(|| trigger.reason().to_string());
                        (entry.amount, entry.next_balance, reason)
                    }),
                _ => None,
            };
            if let Some((granted, balance, reason)) = committed {
                self.publisher
                    .publish(&BillingEvent::credits_granted(
                        &key,
                        CreditsGrantedPayload {
                            user_id: user_id.clone(),
                            provider_subscription_id: provider_subscription_id.clone(),
                            granted,
                            balance,
                            reason,
                            current_period_end: period_end.map(epoch_ms),
                        },
                    )?)
                    .await?;
            }
            Some(outcome)
        } else {
            tracing::debug!(status = %profile.status, "Status not entitled, no grant");
            None
        };

        self.publisher
            .publish(&BillingEvent::subscription_synced(SubscriptionSyncedPayload {
                user_id: user_id.clone(),
                provider_subscription_id: provider_subscription_id.clone(),
                status: profile.status.clone(),
                current_period_end: period_end.map(epoch_ms),
            })?)
            .await?;

        let mut expiry_check_scheduled = false;
        if let Some(period_end) = period_end {
            if let Some(run_at) = expiry_check_run_at(period_end, now, &self.settings) {
                expiry_check_scheduled = self
                    .scheduler
                    .schedule(&ExpiryCheck {
                        user_id: user_id.clone(),
                        provider_subscription_id: provider_subscription_id.clone(),
                        current_period_end: period_end,
                        run_at,
                    })
                    .await?;
            }
        }

        tracing::info!(
            subscription_id = %profile.id,
            user_id = %user_id,
            status = %profile.status,
            granted = grant.as_ref().is_some_and(GrantOutcome::is_granted),
            "Reconciled billing webhook"
        );

        Ok(ReconcileOutcome::Synced(SyncReport {
            event_id: event.id,
            subscription_id: profile.id,
            user_id,
            provider_subscription_id,
            status: profile.status,
            grant,
            expiry_check_scheduled,
        }))
    }

    /// Fires ahead of a period's end. Emits a pre-expiry notice only when the
    /// user is still entitled; returns whether it did.
    #[instrument(skip(self), fields(user_id = %check.user_id, provider_subscription_id = %check.provider_subscription_id))]
    pub async fn run_expiry_check(&self, check: &ExpiryCheck) -> AppResult<bool> {
        if !self.subscriptions.has_entitlement(&check.user_id).await? {
            tracing::debug!("User no longer entitled, skipping pre-expiry notice");
            return Ok(false);
        }
        self.publisher
            .publish(&BillingEvent::pre_expiry(PreExpiryPayload {
                user_id: check.user_id.clone(),
                provider_subscription_id: check.provider_subscription_id.clone(),
                current_period_end: epoch_ms(check.current_period_end),
            })?)
            .await?;
        Ok(true)
    }

    /// Metadata user id wins; customer email is the fallback.
    async fn resolve_user(&self, event: &ParsedEvent) -> AppResult<Option<String>> {
        let (metadata_user, email) = match &event.entity {
            BillingEntity::Subscription(sub) => (sub.metadata_user_id(), sub.customer_email()),
            BillingEntity::Order { order, subscription } => (
                order
                    .metadata_user_id()
                    .or_else(|| subscription.as_ref().and_then(SubscriptionPayload::metadata_user_id)),
                order
                    .customer_email()
                    .or_else(|| subscription.as_ref().and_then(SubscriptionPayload::customer_email)),
            ),
        };

        if let Some(user_id) = metadata_user {
            return Ok(Some(user_id.to_string()));
        }
        match email {
            Some(email) => self.user_directory.find_user_id_by_email(email).await,
            None => Ok(None),
        }
    }
}

fn discard(reason: DiscardReason) -> ReconcileOutcome {
    tracing::info!(reason = reason.as_str(), "Discarding billing webhook");
    ReconcileOutcome::Discarded(reason)
}

fn provider_subscription_id(entity: &BillingEntity) -> Option<String> {
    let id = match entity {
        BillingEntity::Subscription(sub) => Some(sub.id.as_str()),
        BillingEntity::Order { order, subscription } => subscription
            .as_ref()
            .map(|s| s.id.as_str())
            .or(order.subscription_id.as_deref()),
    };
    id.map(str::trim).filter(|id| !id.is_empty()).map(str::to_string)
}

fn subscription_fields(sub: &SubscriptionPayload) -> SubscriptionFields {
    SubscriptionFields {
        provider_customer_id: sub.customer_id().map(str::to_string),
        status: Some(sub.status.clone()),
        current_period_end: sub.current_period_end,
        trial_ends_at: sub.trial_ends_at,
        cancel_at: sub.cancel_at,
        canceled_at: sub.canceled_at,
        product_id: sub.product_id().map(str::to_string),
        price_id: sub.price_id.clone(),
        plan_code: sub.plan_code().map(str::to_string),
        seats: sub.seats,
        metadata: sub.metadata.clone().map(JsonValue::Object),
        credits_grant_per_period: None,
        credits_rollover_limit: None,
    }
}

/// Map the provider entity onto stored fields. Missing values stay `None` so
/// the upsert keeps what is stored; only the status gets a fallback.
fn normalize(entity: &BillingEntity) -> SubscriptionFields {
    let mut fields = match entity {
        BillingEntity::Subscription(sub) => subscription_fields(sub),
        BillingEntity::Order { order, subscription } => {
            let mut fields = subscription.as_ref().map(subscription_fields).unwrap_or_default();
            fields.status = fields.status.or_else(|| order.status.clone());
            fields.provider_customer_id = fields
                .provider_customer_id
                .or_else(|| order.customer_id().map(str::to_string));
            fields.product_id = fields.product_id.or_else(|| order.product_id().map(str::to_string));
            fields.price_id = fields.price_id.or_else(|| order.price_id.clone());
            fields.metadata = fields.metadata.or_else(|| order.metadata.clone().map(JsonValue::Object));
            fields
        }
    };
    fields.status = fields
        .status
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .or_else(|| Some(FALLBACK_STATUS.to_string()));
    fields
}
