use crate::{
    adapters::http::app_state::AppState,
    infra::{config::AppConfig, postgres_persistence},
    ports::{
        event_publisher::{EventPublisher, OutboxRepo},
        expiry_scheduler::{ExpiryCheckQueue, ExpiryScheduler},
        user_directory::UserDirectory,
    },
    use_cases::{
        credits::CreditUseCases,
        event_relay::EventRelayUseCases,
        ledger::{LedgerRepo, LedgerUseCases},
        reconciliation::ReconciliationUseCases,
        subscription::{SubscriptionRepo, SubscriptionUseCases},
    },
};
use std::fs::File;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub async fn init_app_state() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env();

    let postgres_arc = Arc::new(postgres_persistence(&config.database_url).await?);

    let subscription_repo_arc = postgres_arc.clone() as Arc<dyn SubscriptionRepo>;
    let ledger_repo_arc = postgres_arc.clone() as Arc<dyn LedgerRepo>;
    let policy = Arc::new(config.entitlement_policy());

    let subscription_use_cases = SubscriptionUseCases::new(subscription_repo_arc.clone(), policy.clone());
    let credit_use_cases = CreditUseCases::new(
        subscription_repo_arc,
        ledger_repo_arc.clone(),
        policy,
        config.balance_cas_retries,
    );
    let reconciliation_use_cases = ReconciliationUseCases::new(
        subscription_use_cases.clone(),
        credit_use_cases.clone(),
        postgres_arc.clone() as Arc<dyn UserDirectory>,
        postgres_arc.clone() as Arc<dyn EventPublisher>,
        postgres_arc.clone() as Arc<dyn ExpiryScheduler>,
        config.reconciliation_settings(),
    );
    let event_relay_use_cases = EventRelayUseCases::new(postgres_arc.clone() as Arc<dyn OutboxRepo>);

    Ok(AppState {
        config: Arc::new(config),
        subscription_use_cases: Arc::new(subscription_use_cases),
        credit_use_cases: Arc::new(credit_use_cases),
        ledger_use_cases: Arc::new(LedgerUseCases::new(ledger_repo_arc)),
        reconciliation_use_cases: Arc::new(reconciliation_use_cases),
        event_relay_use_cases: Arc::new(event_relay_use_cases),
        expiry_queue: postgres_arc as Arc<dyn ExpiryCheckQueue>,
    })
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "credit_ledger=debug,tower_http=debug".into());

    // Console (pretty logs)
    let console_layer = fmt::layer().with_target(false).with_level(true).pretty();

    // File (structured JSON logs)
    let file = File::create("app.log").expect("cannot create log file");
    let json_layer = fmt::layer()
        .json()
        .with_writer(file)
        .with_current_span(true)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
