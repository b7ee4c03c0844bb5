//! Signed-in user's credits, entitlement and ledger.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::json;

use crate::{
    adapters::http::{app_state::AppState, auth::current_user_id},
    app_error::AppResult,
    use_cases::credits::{ConsumeError, ConsumeOutcome},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/balance", get(get_balance))
        .route("/entitlement", get(get_entitlement))
        .route("/subscription", get(get_subscription))
        .route("/ledger", get(list_ledger))
        .route("/consume", post(consume))
}

/// GET /api/credits/balance
async fn get_balance(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&headers, &jar, &app_state)?;
    let balance = app_state.subscription_use_cases.get_credit_balance(&user_id).await?;
    Ok(Json(json!({ "balance": balance })))
}

/// GET /api/credits/entitlement
async fn get_entitlement(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&headers, &jar, &app_state)?;
    let entitled = app_state.subscription_use_cases.has_entitlement(&user_id).await?;
    Ok(Json(json!({ "entitled": entitled })))
}

/// GET /api/credits/subscription
async fn get_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&headers, &jar, &app_state)?;
    let subscription = app_state
        .subscription_use_cases
        .get_subscription_for_user(&user_id)
        .await?;
    Ok(Json(json!({ "subscription": subscription })))
}

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    limit: Option<i64>,
}

/// GET /api/credits/ledger?limit=
async fn list_ledger(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<LedgerQuery>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&headers, &jar, &app_state)?;
    let entries = app_state
        .ledger_use_cases
        .list_for_user(&user_id, query.limit)
        .await?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumePayload {
    amount: i64,
    reason: Option<String>,
    idempotency_key: Option<String>,
}

/// POST /api/credits/consume
async fn consume(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<ConsumePayload>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&headers, &jar, &app_state)?;
    let outcome = app_state
        .credit_use_cases
        .consume_credits(
            &user_id,
            payload.amount,
            payload.reason.as_deref(),
            payload.idempotency_key.as_deref(),
        )
        .await?;
    Ok((consume_status(&outcome), Json(outcome)))
}

fn consume_status(outcome: &ConsumeOutcome) -> StatusCode {
    match outcome {
        ConsumeOutcome::Consumed { .. } | ConsumeOutcome::Idempotent => StatusCode::OK,
        ConsumeOutcome::Rejected(ConsumeError::InvalidAmount) => StatusCode::BAD_REQUEST,
        ConsumeOutcome::Rejected(ConsumeError::NoSubscription | ConsumeError::NotEntitled) => {
            StatusCode::FORBIDDEN
        }
        ConsumeOutcome::Rejected(ConsumeError::InsufficientBalance { .. }) => {
            StatusCode::PAYMENT_REQUIRED
        }
    }
}
