use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{error, info, warn};
use url::Url;

use crate::application::use_cases::event_relay::EventRelayUseCases;
use crate::infra::event_signer::sign_event_payload;
use crate::ports::event_publisher::OutboxMessage;

const STALE_CHECK_INTERVAL_SECS: u64 = 60;
const STALE_THRESHOLD_SECS: i64 = 300;
const BATCH_SIZE: i64 = 50;
const MAX_CONCURRENT_DELIVERIES: usize = 10;
const HTTP_TIMEOUT_SECS: u64 = 10;
const RESPONSE_BODY_CAP: usize = 1024;

pub const EVENT_ID_HEADER: &str = "X-Billing-Event-Id";
pub const EVENT_NAME_HEADER: &str = "X-Billing-Event-Name";
pub const EVENT_SIGNATURE_HEADER: &str = "X-Billing-Signature";

/// Where relayed events go.
#[derive(Clone)]
pub struct EventBusTarget {
    pub url: Url,
    pub signing_key: Option<SecretString>,
}

pub async fn run_event_relay_loop(relay: Arc<EventRelayUseCases>, target: EventBusTarget, poll_secs: u64) {
    let mut delivery_ticker = interval(Duration::from_secs(poll_secs.max(1)));
    let mut stale_ticker = interval(Duration::from_secs(STALE_CHECK_INTERVAL_SECS));

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES));

    let client = match build_client() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build event bus HTTP client, relay disabled");
            return;
        }
    };

    info!(
        url = %target.url,
        "Event relay worker started (polling every {}s, max {} concurrent)",
        poll_secs, MAX_CONCURRENT_DELIVERIES
    );

    loop {
        tokio::select! {
            _ = delivery_ticker.tick() => {
                process_batch(&relay, &client, &target, &semaphore).await;
            }
            _ = stale_ticker.tick() => {
                release_stale(&relay).await;
            }
        }
    }
}

fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

async fn process_batch(
    relay: &Arc<EventRelayUseCases>,
    client: &reqwest::Client,
    target: &EventBusTarget,
    semaphore: &Arc<Semaphore>,
) {
    let messages = match relay.claim_pending(BATCH_SIZE).await {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "Failed to claim pending billing events");
            return;
        }
    };

    if messages.is_empty() {
        return;
    }

    info!(count = messages.len(), "Relaying billing events");

    let mut deliveries = JoinSet::new();
    for message in messages {
        let relay = Arc::clone(relay);
        let client = client.clone();
        let target = target.clone();
        let sem = Arc::clone(semaphore);

        deliveries.spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            deliver_one(&relay, &client, &target, &message).await;
        });
    }
    while let Some(joined) = deliveries.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Billing event delivery task panicked");
        }
    }
}

/// Wire body posted to the event bus.
fn event_body(message: &OutboxMessage) -> String {
    json!({
        "name": message.event_name,
        "id": message.idempotency_id,
        "data": message.payload,
        "ts": message.created_at.timestamp_millis(),
    })
    .to_string()
}

async fn deliver_one(
    relay: &EventRelayUseCases,
    client: &reqwest::Client,
    target: &EventBusTarget,
    message: &OutboxMessage,
) {
    let body = event_body(message);

    let mut request = client
        .post(target.url.clone())
        .header("Content-Type", "application/json")
        .header(EVENT_ID_HEADER, &message.idempotency_id)
        .header(EVENT_NAME_HEADER, &message.event_name);
    if let Some(key) = &target.signing_key {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = sign_event_payload(key.expose_secret().as_bytes(), timestamp, &body);
        request = request.header(EVENT_SIGNATURE_HEADER, signature);
    }

    let recorded = match request.body(body).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if response.status().is_success() {
                relay.record_success(message.id).await
            } else {
                let text = response.text().await.unwrap_or_default();
                let error = format!("HTTP {}: {}", status, truncate_chars(&text, RESPONSE_BODY_CAP));
                relay
                    .record_failure(message, &error, is_terminal_status(status))
                    .await
            }
        }
        Err(e) => {
            relay
                .record_failure(message, &format!("HTTP error: {}", e), false)
                .await
        }
    };

    if let Err(e) = recorded {
        error!(
            message_id = %message.id,
            error = %e,
            "Failed to record billing event delivery result"
        );
    }
}

fn is_terminal_status(status: u16) -> bool {
    // 408, 409 and 429 are worth retrying.
    (400..500).contains(&status) && !matches!(status, 408 | 409 | 429)
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

async fn release_stale(relay: &EventRelayUseCases) {
    match relay.release_stale(STALE_THRESHOLD_SECS).await {
        Ok(count) if count > 0 => {
            warn!(count, "Released stale billing event claims");
        }
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "Failed to release stale billing event claims");
        }
    }
}
