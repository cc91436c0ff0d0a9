//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the reconciliation engine.
///
/// The taxonomy separates synchronous validation failures (no side effects,
/// no retry), security-relevant verification mismatches, transient
/// infrastructure errors (safe to retry thanks to idempotency), and
/// post-payment failures that escalate to compensation.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Request rejected before any side effect.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    /// Plan exists but has no gateway price configured for the requested cycle.
    #[error("Plan '{0}' has no gateway price configured for this billing cycle")]
    MissingPriceConfig(String),

    /// Claimed payment does not match the gateway's record (amount, metadata,
    /// or terminal status). Security-relevant: recorded as a Failed payment,
    /// never refunded unless a real charge is confirmed.
    #[error("Payment verification failed: {0}")]
    Verification(String),

    /// Gateway API error. Retryable by the caller.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Gateway call timed out. The outcome is unknown: the local transaction
    /// is aborted and the caller must verify manually, never auto-refund.
    #[error("Gateway request timed out; payment state unknown, verify manually")]
    GatewayTimeout,

    #[error("Database error: {0}")]
    Database(String),

    /// Concurrent activation lost the race on the owner's subscription row.
    /// Retryable.
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Payment was verified and then refunded because the local activation
    /// could not be committed. The caller should restart checkout.
    #[error("Activation failed and the payment was refunded: {0}")]
    ActivationRefunded(String),

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    /// Money moved externally but no local state committed and no refundable
    /// reference could be resolved. Terminal; requires operator intervention.
    #[error("Compensation required: {0}")]
    CompensationRequired(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the caller can safely retry the failed operation.
    ///
    /// Idempotency makes retries of transient failures safe; validation and
    /// verification failures are not retryable by definition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Gateway(_)
                | BillingError::GatewayTimeout
                | BillingError::Database(_)
                | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match e {
            stripe::StripeError::Timeout => BillingError::GatewayTimeout,
            other => BillingError::Gateway(other.to_string()),
        }
    }
}
