//! Billing endpoints
//!
//! Checkout initiation, post-checkout confirmation, the gateway webhook, a
//! subscription readback, and the admin price sync trigger. Handlers stay
//! thin: identity extraction, request parsing, one engine call.

use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use bidcraft_billing::{ActivationOutcome, BillingCycle, BillingError, ADDON_OFFERS};

use crate::error::ApiError;
use crate::state::AppState;

/// Caller identity, injected by the fronting auth proxy.
const ACCOUNT_HEADER: &str = "x-account-id";

fn account_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| {
            ApiError(BillingError::Validation(
                "Missing or invalid account identity header".to_string(),
            ))
        })
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: String,
    pub cycle: BillingCycle,
}

#[derive(Debug, Deserialize)]
pub struct AddonCheckoutRequest {
    pub addon_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub session_id: String,
}

pub async fn start_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = account_id(&headers)?;
    let response = state
        .billing
        .checkout
        .start_plan_checkout(account_id, &req.plan, req.cycle)
        .await?;
    Ok(Json(json!({ "success": true, "data": response })))
}

pub async fn start_custom_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = account_id(&headers)?;
    let response = state
        .billing
        .checkout
        .start_custom_plan_checkout(account_id, &req.plan, req.cycle)
        .await?;
    Ok(Json(json!({ "success": true, "data": response })))
}

pub async fn start_addon_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AddonCheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = account_id(&headers)?;
    let response = state
        .billing
        .checkout
        .start_addon_checkout(account_id, &req.addon_id)
        .await?;
    Ok(Json(json!({ "success": true, "data": response })))
}

/// Post-redirect confirmation. Idempotent with the webhook path; whichever
/// arrives first performs the activation, the other gets the existing state.
pub async fn confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConfirmRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Identity is required so unauthenticated clients cannot probe session
    // ids; the activation itself trusts only gateway-verified state.
    let _ = account_id(&headers)?;

    let outcome = state
        .billing
        .activation
        .activate_session(&req.session_id)
        .await?;
    let already_processed = matches!(outcome, ActivationOutcome::AlreadyProcessed(_));

    Ok(Json(json!({
        "success": true,
        "already_processed": already_processed,
        "data": outcome.subscription(),
    })))
}

/// Gateway webhook. A `200` here means only "delivery accepted"; processing
/// failures are recorded internally and retried via gateway redelivery.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError(BillingError::WebhookSignatureInvalid))?;

    state.billing.webhooks.handle(&body, signature).await?;
    Ok(Json(json!({ "received": true })))
}

pub async fn subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = account_id(&headers)?;
    let subscription = state.billing.store.subscription_by_owner(account_id).await?;
    Ok(Json(json!({ "success": true, "data": subscription })))
}

pub async fn addons() -> impl IntoResponse {
    Json(json!({ "success": true, "data": ADDON_OFFERS }))
}

pub async fn sync_prices(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.billing.sync.sync_all().await?;
    Ok(Json(json!({ "success": true, "data": report })))
}
