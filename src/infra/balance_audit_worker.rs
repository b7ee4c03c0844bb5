use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, warn};

use crate::application::use_cases::ledger::LedgerUseCases;

const AUDIT_LIMIT: i64 = 500;

pub async fn run_balance_audit_loop(ledger: Arc<LedgerUseCases>, interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

    info!("Balance audit worker started (every {}s)", interval_secs);

    loop {
        ticker.tick().await;
        audit_once(&ledger).await;
    }
}

async fn audit_once(ledger: &LedgerUseCases) -> usize {
    match ledger.audit_balances(AUDIT_LIMIT).await {
        Ok(drifts) if drifts.is_empty() => 0,
        Ok(drifts) => {
            warn!(count = drifts.len(), "Balance audit found drift");
            drifts.len()
        }
        Err(e) => {
            error!(error = %e, "Balance audit failed");
            0
        }
    }
}
