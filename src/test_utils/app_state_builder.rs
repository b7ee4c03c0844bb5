//! Test app state builder for HTTP-level testing.
//!
//! `TestAppStateBuilder` wires every use case to the in-memory stores and
//! returns handles to them so tests can assert on stored state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use secrecy::SecretString;

use crate::{
    adapters::http::app_state::AppState,
    infra::{
        config::AppConfig,
        webhook_verifier::{
            WEBHOOK_ID_HEADER, WEBHOOK_SIGNATURE_HEADER, WEBHOOK_TIMESTAMP_HEADER, WebhookVerifier,
        },
    },
    jwt,
    ports::event_publisher::EventPublisher,
    test_utils::{InMemoryCreditStore, InMemoryExpiryScheduler, InMemoryOutbox, InMemoryUserDirectory},
    use_cases::{
        credits::{CreditUseCases, DEFAULT_CAS_RETRIES},
        event_relay::EventRelayUseCases,
        ledger::LedgerUseCases,
        reconciliation::ReconciliationUseCases,
        subscription::{SubscriptionProfile, SubscriptionUseCases},
    },
};

pub const TEST_JWT_SECRET: &str = "test_jwt_secret";
pub const TEST_INTERNAL_TOKEN: &str = "test_internal_token";
/// base64 of `test-webhook-secret`.
pub const TEST_WEBHOOK_SECRET: &str = "whsec_dGVzdC13ZWJob29rLXNlY3JldA==";

/// Handles to the in-memory stores behind a built `AppState`.
pub struct TestMocks {
    pub store: Arc<InMemoryCreditStore>,
    pub outbox: Arc<InMemoryOutbox>,
    pub scheduler: Arc<InMemoryExpiryScheduler>,
}

/// Builder for creating `AppState` with in-memory mocks for testing.
///
/// ```ignore
/// let sub = create_test_subscription(|s| s.credits_balance = 5);
/// let (app_state, mocks) = TestAppStateBuilder::new().with_subscription(sub).build_with_mocks();
/// ```
pub struct TestAppStateBuilder {
    subscriptions: Vec<SubscriptionProfile>,
    users: Vec<(String, String)>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl TestAppStateBuilder {
    pub fn new() -> Self {
        Self {
            subscriptions: vec![],
            users: vec![],
            publisher: None,
        }
    }

    pub fn with_subscription(mut self, subscription: SubscriptionProfile) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Register a user the directory resolves by email.
    pub fn with_user(mut self, email: &str, user_id: &str) -> Self {
        self.users.push((email.to_string(), user_id.to_string()));
        self
    }

    /// Replace the outbox publisher (e.g. with a failing one).
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> AppState {
        self.build_with_mocks().0
    }

    pub fn build_with_mocks(self) -> (AppState, TestMocks) {
        let store = Arc::new(
            self.subscriptions
                .into_iter()
                .fold(InMemoryCreditStore::new(), InMemoryCreditStore::with_subscription),
        );
        let directory = self
            .users
            .iter()
            .fold(InMemoryUserDirectory::new(), |d, (email, id)| d.with_user(email, id));
        let outbox = Arc::new(InMemoryOutbox::new());
        let scheduler = Arc::new(InMemoryExpiryScheduler::new());
        let publisher: Arc<dyn EventPublisher> = self
            .publisher
            .unwrap_or_else(|| outbox.clone() as Arc<dyn EventPublisher>);

        let config = Arc::new(test_config());
        let policy = Arc::new(config.entitlement_policy());

        let subscription_use_cases = SubscriptionUseCases::new(store.clone(), policy.clone());
        let credit_use_cases = CreditUseCases::new(
            store.clone(),
            store.clone(),
            policy,
            config.balance_cas_retries,
        );
        let reconciliation_use_cases = ReconciliationUseCases::new(
            subscription_use_cases.clone(),
            credit_use_cases.clone(),
            Arc::new(directory),
            publisher,
            scheduler.clone(),
            config.reconciliation_settings(),
        );

        let app_state = AppState {
            config,
            subscription_use_cases: Arc::new(subscription_use_cases),
            credit_use_cases: Arc::new(credit_use_cases),
            ledger_use_cases: Arc::new(LedgerUseCases::new(store.clone())),
            reconciliation_use_cases: Arc::new(reconciliation_use_cases),
            event_relay_use_cases: Arc::new(EventRelayUseCases::new(outbox.clone())),
            expiry_queue: scheduler.clone(),
        };

        (
            app_state,
            TestMocks {
                store,
                outbox,
                scheduler,
            },
        )
    }
}

impl Default for TestAppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: String::new(),
        bind_addr: "127.0.0.1:3001".parse::<SocketAddr>().unwrap(),
        cors_origin: HeaderValue::from_static("http://localhost:3000"),
        jwt_secret: SecretString::new(TEST_JWT_SECRET.into()),
        polar_webhook_secret: SecretString::new(TEST_WEBHOOK_SECRET.into()),
        internal_api_token: SecretString::new(TEST_INTERNAL_TOKEN.into()),
        event_bus_url: None,
        event_bus_signing_key: None,
        entitled_statuses: vec!["active".into(), "trialing".into(), "paid".into()],
        default_grant_per_period: 10,
        default_rollover_limit: 100,
        webhook_grant_amount: 10,
        pre_expiry_lookback_secs: 259_200,
        pre_expiry_min_delay_secs: 5,
        balance_cas_retries: DEFAULT_CAS_RETRIES,
        expiry_worker_poll_secs: 15,
        event_relay_poll_secs: 5,
        balance_audit_interval_secs: 3_600,
    }
}

/// Access token for `user_id` signed with the test JWT secret.
pub fn test_access_token(user_id: &str) -> String {
    jwt::issue(
        user_id,
        &SecretString::new(TEST_JWT_SECRET.into()),
        time::Duration::minutes(5),
    )
    .unwrap()
}

/// Standard Webhooks headers signing `body` with the test webhook secret.
pub fn signed_webhook_headers(msg_id: &str, body: &str) -> Vec<(&'static str, String)> {
    let verifier = WebhookVerifier::new(&SecretString::new(TEST_WEBHOOK_SECRET.into())).unwrap();
    let timestamp = chrono::Utc::now().timestamp();
    let signature = verifier.sign(msg_id, timestamp, body.as_bytes());
    vec![
        (WEBHOOK_ID_HEADER, msg_id.to_string()),
        (WEBHOOK_TIMESTAMP_HEADER, timestamp.to_string()),
        (WEBHOOK_SIGNATURE_HEADER, format!("v1,{}", signature)),
    ]
}
