//! Service-to-service routes guarded by the internal API token.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    adapters::http::{app_state::AppState, auth::require_internal_token},
    app_error::{AppError, AppResult},
    use_cases::{credits::GrantOutcome, subscription::SubscriptionUpsert},
};

const DEFAULT_AUDIT_LIMIT: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/credits/grant", post(grant_credits))
        .route("/credits/audit", get(audit_balances))
        .route("/subscriptions/upsert", post(upsert_subscription))
        .route(
            "/subscriptions/provider/{provider_subscription_id}",
            get(get_by_provider_id),
        )
        .route("/users/{user_id}/subscriptions", get(list_user_subscriptions))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct GrantPayload {
    subscription_id: Uuid,
    #[validate(length(min = 1))]
    idempotency_key: String,
    amount: Option<i64>,
    reason: Option<String>,
}

/// POST /api/internal/credits/grant
async fn grant_credits(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GrantPayload>,
) -> AppResult<impl IntoResponse> {
    require_internal_token(&headers, &app_state)?;
    payload
        .validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let outcome = app_state
        .credit_use_cases
        .grant_credits_if_needed(
            payload.subscription_id,
            &payload.idempotency_key,
            payload.amount,
            payload.reason.as_deref(),
        )
        .await?;
    let status = match outcome {
        GrantOutcome::SubscriptionNotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// POST /api/internal/subscriptions/upsert
async fn upsert_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SubscriptionUpsert>,
) -> AppResult<impl IntoResponse> {
    require_internal_token(&headers, &app_state)?;
    if payload.user_id.trim().is_empty() || payload.provider_subscription_id.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "userId and providerSubscriptionId are required".into(),
        ));
    }

    let subscription = app_state
        .subscription_use_cases
        .upsert_from_polar(&payload)
        .await?;
    Ok(Json(json!({ "subscription": subscription })))
}

/// GET /api/internal/subscriptions/provider/{provider_subscription_id}
async fn get_by_provider_id(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(provider_subscription_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    require_internal_token(&headers, &app_state)?;
    let subscription = app_state
        .subscription_use_cases
        .get_by_provider_id(&provider_subscription_id)
        .await?;
    Ok(Json(json!({ "subscription": subscription })))
}

/// GET /api/internal/users/{user_id}/subscriptions
async fn list_user_subscriptions(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    require_internal_token(&headers, &app_state)?;
    let subscriptions = app_state.subscription_use_cases.get_all_for_user(&user_id).await?;
    let entitled = app_state.subscription_use_cases.has_entitlement(&user_id).await?;
    let balance = app_state.subscription_use_cases.get_credit_balance(&user_id).await?;
    Ok(Json(json!({
        "subscriptions": subscriptions,
        "entitled": entitled,
        "balance": balance,
    })))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<i64>,
}

/// GET /api/internal/credits/audit?limit=
async fn audit_balances(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> AppResult<impl IntoResponse> {
    require_internal_token(&headers, &app_state)?;
    let drifts = app_state
        .ledger_use_cases
        .audit_balances(query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT))
        .await?;
    Ok(Json(json!({ "drifts": drifts })))
}
