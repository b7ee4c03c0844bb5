use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::application::use_cases::reconciliation::ReconciliationUseCases;
use crate::ports::expiry_scheduler::ExpiryCheckQueue;

const BATCH_SIZE: i64 = 50;

pub async fn run_expiry_check_loop(
    reconciliation: Arc<ReconciliationUseCases>,
    queue: Arc<dyn ExpiryCheckQueue>,
    poll_secs: u64,
) {
    let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));

    info!("Expiry check worker started (polling every {}s)", poll_secs);

    loop {
        ticker.tick().await;
        process_due(&reconciliation, queue.as_ref(), Utc::now()).await;
    }
}

/// Run every check due at `now`. A failed check goes back on the queue for
/// the next poll. Returns how many checks completed.
async fn process_due(
    reconciliation: &ReconciliationUseCases,
    queue: &dyn ExpiryCheckQueue,
    now: DateTime<Utc>,
) -> usize {
    let due = match queue.claim_due(now, BATCH_SIZE).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to claim due expiry checks");
            return 0;
        }
    };

    let mut completed = 0;
    for scheduled in due {
        match reconciliation.run_expiry_check(&scheduled.check).await {
            Ok(notified) => {
                if let Err(e) = queue.mark_completed(scheduled.id).await {
                    error!(check_id = %scheduled.id, error = %e, "Failed to complete expiry check");
                    continue;
                }
                info!(
                    check_id = %scheduled.id,
                    provider_subscription_id = %scheduled.check.provider_subscription_id,
                    notified,
                    "Expiry check completed"
                );
                completed += 1;
            }
            Err(e) => {
                warn!(check_id = %scheduled.id, error = %e, "Expiry check failed, will retry");
                if let Err(e) = queue.release(scheduled.id).await {
                    error!(check_id = %scheduled.id, error = %e, "Failed to release expiry check");
                }
            }
        }
    }
    completed
}
