use std::sync::Arc;

use crate::{
    infra::config::AppConfig,
    ports::expiry_scheduler::ExpiryCheckQueue,
    use_cases::{
        credits::CreditUseCases, event_relay::EventRelayUseCases, ledger::LedgerUseCases,
        reconciliation::ReconciliationUseCases, subscription::SubscriptionUseCases,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub subscription_use_cases: Arc<SubscriptionUseCases>,
    pub credit_use_cases: Arc<CreditUseCases>,
    pub ledger_use_cases: Arc<LedgerUseCases>,
    pub reconciliation_use_cases: Arc<ReconciliationUseCases>,
    pub event_relay_use_cases: Arc<EventRelayUseCases>,
    pub expiry_queue: Arc<dyn ExpiryCheckQueue>,
}
