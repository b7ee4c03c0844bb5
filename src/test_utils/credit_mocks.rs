//! In-memory subscription store, ledger and user directory.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    ports::user_directory::UserDirectory,
    use_cases::{
        ledger::{BalanceChange, BalanceDrift, CommitResult, LedgerEntryProfile, LedgerRepo},
        subscription::{
            NewSubscription, SubscriptionFields, SubscriptionPatch, SubscriptionProfile,
            SubscriptionRepo,
        },
    },
};

// ============================================================================
// InMemoryCreditStore
// ============================================================================

#[derive(Default)]
struct CreditState {
    subscriptions: HashMap<Uuid, SubscriptionProfile>,
    ledger: Vec<LedgerEntryProfile>,
}

/// Subscriptions and ledger behind one lock, so a balance change and its
/// ledger row commit together like the Postgres transaction does.
#[derive(Default)]
pub struct InMemoryCreditStore {
    state: Mutex<CreditState>,
    stale_commits: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(self, subscription: SubscriptionProfile) -> Self {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription.id, subscription);
        self
    }

    pub fn subscription(&self, id: Uuid) -> Option<SubscriptionProfile> {
        self.state.lock().unwrap().subscriptions.get(&id).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    /// Ledger rows in commit order.
    pub fn ledger_entries(&self) -> Vec<LedgerEntryProfile> {
        self.state.lock().unwrap().ledger.clone()
    }

    pub fn ledger_len(&self) -> usize {
        self.state.lock().unwrap().ledger.len()
    }

    /// Overwrite a cached balance without a ledger row.
    pub fn set_balance(&self, id: Uuid, balance: i64) {
        if let Some(sub) = self.state.lock().unwrap().subscriptions.get_mut(&id) {
            sub.credits_balance = balance;
        }
    }

    /// Simulate a concurrent writer: the next `n` commits report a stale balance.
    pub fn fail_next_commits_with_stale(&self, n: usize) {
        self.stale_commits.store(n, Ordering::SeqCst);
    }

    /// The next `n` subscription inserts/patches fail without writing anything.
    pub fn fail_next_subscription_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn take_stale_commit(&self) -> bool {
        take_one(&self.stale_commits)
    }

    fn take_failing_write(&self) -> AppResult<()> {
        if take_one(&self.failing_writes) {
            return Err(AppError::Database("subscription write failed".into()));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn detach(state: &mut CreditState, id: Option<Uuid>) {
    if let Some(sub) = id.and_then(|id| state.subscriptions.get_mut(&id)) {
        sub.provider_subscription_id = None;
        sub.updated_at = Utc::now();
    }
}

fn provider_id_taken(state: &CreditState, provider_id: &str, except: Option<Uuid>) -> bool {
    state.subscriptions.values().any(|s| {
        Some(s.id) != except && s.provider_subscription_id.as_deref() == Some(provider_id)
    })
}

fn apply_fields(sub: &mut SubscriptionProfile, fields: &SubscriptionFields) {
    if let Some(v) = &fields.provider_customer_id {
        sub.provider_customer_id = Some(v.clone());
    }
    if let Some(v) = &fields.status {
        sub.status = v.clone();
    }
    if fields.current_period_end.is_some() {
        sub.current_period_end = fields.current_period_end;
    }
    if fields.trial_ends_at.is_some() {
        sub.trial_ends_at = fields.trial_ends_at;
    }
    if fields.cancel_at.is_some() {
        sub.cancel_at = fields.cancel_at;
    }
    if fields.canceled_at.is_some() {
        sub.canceled_at = fields.canceled_at;
    }
    if let Some(v) = &fields.product_id {
        sub.product_id = Some(v.clone());
    }
    if let Some(v) = &fields.price_id {
        sub.price_id = Some(v.clone());
    }
    if let Some(v) = &fields.plan_code {
        sub.plan_code = Some(v.clone());
    }
    if fields.seats.is_some() {
        sub.seats = fields.seats;
    }
    if let Some(v) = &fields.metadata {
        sub.metadata = Some(v.clone());
    }
}

#[async_trait]
impl SubscriptionRepo for InMemoryCreditStore {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<SubscriptionProfile>> {
        Ok(self.subscription(id))
    }

    async fn get_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> AppResult<Option<SubscriptionProfile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .find(|s| s.provider_subscription_id.as_deref() == Some(provider_subscription_id))
            .cloned())
    }

    async fn get_latest_for_user(&self, user_id: &str) -> AppResult<Option<SubscriptionProfile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| (s.updated_at, s.created_at))
            .cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> AppResult<Vec<SubscriptionProfile>> {
        let mut subs: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(subs)
    }

    async fn insert(&self, input: &NewSubscription) -> AppResult<SubscriptionProfile> {
        self.take_failing_write()?;
        let mut state = self.state.lock().unwrap();
        if provider_id_taken(&state, &input.provider_subscription_id, input.detach_from) {
            return Err(AppError::Conflict("provider_subscription_id already exists".into()));
        }
        let now = Utc::now();
        let mut sub = SubscriptionProfile {
            id: Uuid::new_v4(),
            user_id: input.user_id.clone(),
            provider_customer_id: None,
            provider_subscription_id: Some(input.provider_subscription_id.clone()),
            status: input.status.clone(),
            current_period_end: None,
            trial_ends_at: None,
            cancel_at: None,
            canceled_at: None,
            product_id: None,
            price_id: None,
            plan_code: None,
            seats: None,
            metadata: None,
            credits_grant_per_period: input.credits_grant_per_period,
            credits_rollover_limit: input.credits_rollover_limit,
            credits_balance: 0,
            last_grant_cursor: None,
            created_at: now,
            updated_at: now,
        };
        apply_fields(&mut sub, &input.fields);
        sub.status = input.status.clone();
        detach(&mut state, input.detach_from);
        state.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn patch(&self, id: Uuid, patch: &SubscriptionPatch) -> AppResult<SubscriptionProfile> {
        self.take_failing_write()?;
        let mut state = self.state.lock().unwrap();
        let taken = state.subscriptions.values().any(|s| {
            s.id != id
                && Some(s.id) != patch.detach_from
                && s.provider_subscription_id.as_deref() == Some(patch.provider_subscription_id.as_str())
        });
        if taken {
            return Err(AppError::Conflict("provider_subscription_id already exists".into()));
        }
        if !state.subscriptions.contains_key(&id) {
            return Err(AppError::NotFound);
        }
        detach(&mut state, patch.detach_from);
        let sub = state.subscriptions.get_mut(&id).ok_or(AppError::NotFound)?;
        apply_fields(sub, &patch.fields);
        sub.provider_subscription_id = Some(patch.provider_subscription_id.clone());
        sub.credits_grant_per_period = patch.credits_grant_per_period;
        sub.credits_rollover_limit = patch.credits_rollover_limit;
        sub.updated_at = Utc::now();
        Ok(sub.clone())
    }

}

#[async_trait]
impl LedgerRepo for InMemoryCreditStore {
    async fn find_by_idempotency_key(&self, key: &str) -> AppResult<Option<LedgerEntryProfile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .ledger
            .iter()
            .find(|e| e.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn commit_balance_change(&self, change: &BalanceChange) -> AppResult<CommitResult> {
        if self.take_stale_commit() {
            return Ok(CommitResult::StaleBalance);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(key) = &change.idempotency_key {
            if state.ledger.iter().any(|e| e.idempotency_key.as_ref() == Some(key)) {
                return Ok(CommitResult::DuplicateKey);
            }
        }
        let sub = state
            .subscriptions
            .get_mut(&change.subscription_id)
            .ok_or(AppError::NotFound)?;
        if sub.credits_balance != change.prev_balance {
            return Ok(CommitResult::StaleBalance);
        }
        if change.next_balance < 0 {
            return Err(AppError::Database("credits_balance check violated".into()));
        }
        sub.credits_balance = change.next_balance;
        if change.advances_cursor() {
            sub.last_grant_cursor = change.idempotency_key.clone();
        }
        sub.updated_at = Utc::now();

        let entry = LedgerEntryProfile {
            id: Uuid::new_v4(),
            user_id: change.user_id.clone(),
            subscription_id: change.subscription_id,
            amount: change.amount,
            kind: change.kind,
            reason: change.reason.clone(),
            idempotency_key: change.idempotency_key.clone(),
            prev_balance: change.prev_balance,
            next_balance: change.next_balance,
            meta: change.meta(),
            created_at: Utc::now(),
        };
        state.ledger.push(entry.clone());
        Ok(CommitResult::Committed(entry))
    }

    async fn list_for_user(&self, user_id: &str, limit: i64) -> AppResult<Vec<LedgerEntryProfile>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .ledger
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn find_balance_drift(&self, limit: i64) -> AppResult<Vec<BalanceDrift>> {
        let state = self.state.lock().unwrap();
        let mut drifts: Vec<BalanceDrift> = state
            .subscriptions
            .values()
            .filter_map(|sub| {
                let ledger_balance: i64 = state
                    .ledger
                    .iter()
                    .filter(|e| e.subscription_id == sub.id)
                    .map(|e| e.next_balance - e.prev_balance)
                    .sum();
                (ledger_balance != sub.credits_balance).then(|| BalanceDrift {
                    subscription_id: sub.id,
                    user_id: sub.user_id.clone(),
                    cached_balance: sub.credits_balance,
                    ledger_balance,
                })
            })
            .collect();
        drifts.sort_by_key(|d| d.subscription_id);
        drifts.truncate(limit.max(0) as usize);
        Ok(drifts)
    }
}

// ============================================================================
// InMemoryUserDirectory
// ============================================================================

#[derive(Default)]
pub struct InMemoryUserDirectory {
    pub users: Mutex<HashMap<String, String>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, email: &str, user_id: &str) -> Self {
        self.users
            .lock()
            .unwrap()
            .insert(email.to_lowercase(), user_id.to_string());
        self
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_user_id_by_email(&self, email: &str) -> AppResult<Option<String>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(&email.trim().to_lowercase())
            .cloned())
    }
}
