pub mod billing_webhook;
pub mod credits;
pub mod internal;

use axum::{Json, Router, routing::get};
use serde_json::{Value, json};

use crate::adapters::http::app_state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .nest("/billing", billing_webhook::router())
        .nest("/credits", credits::router())
        .nest("/internal", internal::router())
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}
