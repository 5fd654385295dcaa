use axum::{
    extract::Extension,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::{auth, billing, houses, usage};

async fn root() -> &'static str {
    "Rental Data API"
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    let database = match &state.database {
        Some(db) if db.is_connected() => "connected",
        Some(_) => "disconnected",
        None => "memory",
    };
    Json(json!({ "status": "ok", "database": database }))
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/auth/register", post(auth::register_user))
        .route("/api/auth/login", post(auth::login_user))
        .route("/api/auth/me", get(auth::current_user))
        .route(
            "/api/auth/check-subscription",
            get(auth::check_subscription),
        )
        .route("/api/house", post(houses::lookup_house))
        .route("/api/user/usage", get(usage::user_usage))
        .route("/api/usage/all", get(usage::provider_usage))
        .route("/api/billing/webhook", post(billing::billing_webhook))
}

/// Full application router with state attached. Metrics are layered on by the binary.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(health))
        .merge(api_routes())
        .layer(Extension(state))
}
