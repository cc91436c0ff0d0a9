//! HTTP error mapping
//!
//! Every handler returns `ApiError`; the billing error taxonomy maps onto
//! status codes here and nowhere else. Client-facing bodies carry a
//! `success: false` envelope with a single error string.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use bidcraft_billing::BillingError;

pub struct ApiError(pub BillingError);

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        ApiError(e)
    }
}

fn status_for(error: &BillingError) -> StatusCode {
    match error {
        BillingError::Validation(_) | BillingError::MissingPriceConfig(_) => {
            StatusCode::BAD_REQUEST
        }
        BillingError::WebhookSignatureInvalid => StatusCode::BAD_REQUEST,
        BillingError::PlanNotFound(_) | BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        // A rejected payment claim: the charge did not verify against the
        // gateway, or it verified and was refunded.
        BillingError::Verification(_) | BillingError::ActivationRefunded(_) => {
            StatusCode::PAYMENT_REQUIRED
        }
        BillingError::ConcurrentModification(_) => StatusCode::CONFLICT,
        BillingError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        BillingError::Gateway(_) | BillingError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::RefundFailed(_)
        | BillingError::CompensationRequired(_)
        | BillingError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, status = %status, "Request failed");
        } else {
            tracing::warn!(error = %self.0, status = %status, "Request rejected");
        }

        let body = Json(json!({
            "success": false,
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
