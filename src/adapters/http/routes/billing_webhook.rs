//! Billing-provider webhook receiver.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, warn};

use crate::{
    adapters::http::{app_error_impl::error_resp, app_state::AppState},
    app_error::{AppError, AppResult, ErrorCode},
    infra::webhook_verifier::{WEBHOOK_ID_HEADER, WebhookVerifier},
    use_cases::reconciliation::ReconcileOutcome,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook", post(receive_webhook))
}

/// POST /api/billing/webhook
///
/// 200 once the event is reconciled, 202 when it is not actionable, 500 on
/// store failures so the provider redelivers.
async fn receive_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let verifier = WebhookVerifier::new(&app_state.config.polar_webhook_secret)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if let Err(e) = verifier.verify(&headers, &body, Utc::now().timestamp()) {
        warn!(error = %e, "Rejected billing webhook");
        return Err(AppError::InvalidCredentials);
    }

    let raw = envelope(&headers, &body);
    let event_id = raw.get("id").and_then(JsonValue::as_str).unwrap_or_default().to_string();
    let event_type = raw.get("type").and_then(JsonValue::as_str).unwrap_or_default().to_string();

    match app_state.reconciliation_use_cases.handle_event(&raw).await {
        Ok(ReconcileOutcome::Synced(report)) => {
            Ok((StatusCode::OK, Json(json!({ "ok": true, "sync": report }))).into_response())
        }
        Ok(ReconcileOutcome::Discarded(reason)) => Ok(discarded(reason.as_str())),
        Err(e) if e.is_retryable() => {
            error!(
                error = %e,
                event_id = %event_id,
                event_type = %event_type,
                retryable = true,
                "Webhook processing failed, returning 500 for provider retry"
            );
            Ok(error_resp(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, None))
        }
        Err(e) => {
            debug!(
                error = %e,
                event_id = %event_id,
                event_type = %event_type,
                retryable = false,
                "Non-retryable webhook error, acknowledging"
            );
            Ok(discarded("non-retryable-error"))
        }
    }
}

fn discarded(reason: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "ok": true, "discarded": true, "reason": reason })),
    )
        .into_response()
}

/// The `{id, type, data}` envelope. The delivery id stands in for a missing
/// event id. Unparseable bodies become `null`, which the workflow discards.
fn envelope(headers: &HeaderMap, body: &[u8]) -> JsonValue {
    let mut raw: JsonValue = serde_json::from_slice(body).unwrap_or(JsonValue::Null);
    let has_id = raw
        .get("id")
        .and_then(JsonValue::as_str)
        .is_some_and(|id| !id.trim().is_empty());
    if let (false, Some(obj)) = (has_id, raw.as_object_mut()) {
        if let Some(msg_id) = headers.get(WEBHOOK_ID_HEADER).and_then(|v| v.to_str().ok()) {
            obj.insert("id".into(), JsonValue::String(msg_id.to_string()));
        }
    }
    raw
}
