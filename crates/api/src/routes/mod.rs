//! Route registration

pub mod billing;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/billing/checkout", post(billing::start_checkout))
        .route(
            "/api/billing/checkout/custom",
            post(billing::start_custom_checkout),
        )
        .route(
            "/api/billing/checkout/addon",
            post(billing::start_addon_checkout),
        )
        .route("/api/billing/confirm", post(billing::confirm))
        .route("/api/billing/webhook", post(billing::webhook))
        .route("/api/billing/subscription", get(billing::subscription))
        .route("/api/billing/addons", get(billing::addons))
        .route("/api/admin/billing/sync", post(billing::sync_prices))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
