//! Payment gateway port
//!
//! Contract for the external payment processor. The engine never trusts
//! webhook payload state for money or entitlement decisions; it re-fetches
//! everything through this interface. Implementations: `StripeGateway`
//! (production) and `MockGateway` (tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::types::BillingCycle;

/// Checkout session mode: recurring plans vs one-time charges (add-ons and
/// enterprise custom plans).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Subscription,
    OneTime,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Subscription => "subscription",
            SessionMode::OneTime => "one_time",
        }
    }
}

/// What a checkout session is paying for. Stored in session metadata so the
/// purchase intent can be reconstructed without further lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseKind {
    Plan,
    Addon,
    CustomPlan,
}

impl PurchaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseKind::Plan => "plan",
            PurchaseKind::Addon => "addon",
            PurchaseKind::CustomPlan => "custom_plan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(PurchaseKind::Plan),
            "addon" => Some(PurchaseKind::Addon),
            "custom_plan" => Some(PurchaseKind::CustomPlan),
            _ => None,
        }
    }
}

/// Metadata tagged onto every session and propagated to payments.
///
/// Sufficient to reconstruct `{owner, plan, cycle, expected price}` from the
/// gateway object alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub account_id: Uuid,
    pub plan_name: String,
    pub billing_cycle: BillingCycle,
    pub expected_price_ref: Option<String>,
    pub kind: PurchaseKind,
    pub addon_id: Option<String>,
}

impl CheckoutMetadata {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("account_id".to_string(), self.account_id.to_string());
        map.insert("plan".to_string(), self.plan_name.clone());
        map.insert("cycle".to_string(), self.billing_cycle.as_str().to_string());
        map.insert("kind".to_string(), self.kind.as_str().to_string());
        if let Some(price) = &self.expected_price_ref {
            map.insert("expected_price".to_string(), price.clone());
        }
        if let Some(addon) = &self.addon_id {
            map.insert("addon".to_string(), addon.clone());
        }
        map
    }

    /// Parse back from gateway metadata. Missing required keys are a
    /// verification failure, not a panic.
    pub fn from_map(map: &HashMap<String, String>) -> BillingResult<Self> {
        let account_id = map
            .get("account_id")
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| {
                BillingError::Verification("metadata missing account_id".to_string())
            })?;
        let plan_name = map
            .get("plan")
            .cloned()
            .ok_or_else(|| BillingError::Verification("metadata missing plan".to_string()))?;
        let billing_cycle = map
            .get("cycle")
            .and_then(|v| BillingCycle::parse(v))
            .ok_or_else(|| BillingError::Verification("metadata missing cycle".to_string()))?;
        let kind = map
            .get("kind")
            .and_then(|v| PurchaseKind::parse(v))
            .unwrap_or(PurchaseKind::Plan);

        Ok(Self {
            account_id,
            plan_name,
            billing_cycle,
            expected_price_ref: map.get("expected_price").cloned(),
            kind,
            addon_id: map.get("addon").cloned(),
        })
    }
}

/// Request to create a remote customer.
#[derive(Debug, Clone)]
pub struct CustomerSpec {
    pub account_id: Uuid,
    pub email: String,
    pub display_name: String,
}

/// Request to open a gateway-hosted checkout session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub customer_ref: String,
    pub mode: SessionMode,
    /// Recurring sessions reference a configured gateway price.
    pub price_ref: Option<String>,
    /// One-time sessions charge an explicit amount.
    pub amount_cents: Option<i64>,
    pub description: String,
    pub metadata: CheckoutMetadata,
    pub success_url: String,
    pub cancel_url: String,
}

/// Redirect handle returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub redirect_url: String,
}

/// Terminal and non-terminal payment states as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentStatus {
    Succeeded,
    Processing,
    RequiresAction,
    Canceled,
    Failed,
}

impl GatewayPaymentStatus {
    /// Only `Succeeded` permits an activation.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, GatewayPaymentStatus::Succeeded)
    }
}

/// Fresh point-in-time view of a payment, fetched by reference.
#[derive(Debug, Clone)]
pub struct PaymentView {
    pub txn_ref: String,
    pub status: GatewayPaymentStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub charge_ref: Option<String>,
    pub customer_ref: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_unix: i64,
}

/// Fresh view of a checkout session.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: String,
    pub mode: SessionMode,
    pub paid: bool,
    pub payment_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub customer_ref: Option<String>,
    pub amount_total_cents: Option<i64>,
    pub metadata: HashMap<String, String>,
}

/// Fresh view of a recurring gateway subscription.
#[derive(Debug, Clone)]
pub struct GatewaySubscriptionView {
    pub subscription_ref: String,
    pub status: String,
    pub customer_ref: String,
    pub price_ref: Option<String>,
    pub product_ref: Option<String>,
    pub period_start_unix: i64,
    pub period_end_unix: i64,
    pub metadata: HashMap<String, String>,
}

/// Canonical price record for a product.
#[derive(Debug, Clone)]
pub struct PriceView {
    pub price_ref: String,
    pub product_ref: String,
    pub amount_cents: i64,
    pub currency: String,
    pub recurring_interval: Option<String>,
}

/// Charge summary used for best-effort refund matching.
#[derive(Debug, Clone)]
pub struct ChargeView {
    pub charge_ref: String,
    pub payment_intent_ref: Option<String>,
    pub amount_cents: i64,
    pub created_unix: i64,
    pub refunded: bool,
}

/// Refund request: at least one of the references must be set.
#[derive(Debug, Clone)]
pub struct RefundSpec {
    pub payment_intent_ref: Option<String>,
    pub charge_ref: Option<String>,
    pub reason: String,
    pub metadata: HashMap<String, String>,
}

/// Authenticated raw event envelope. Classification happens in the
/// dispatcher; the payload is never trusted for entitlement decisions.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub created_unix: i64,
    pub object: serde_json::Value,
}

/// Port for the external payment processor of record.
///
/// All state is fetched by ID, never pushed in full. Read operations may be
/// retried by implementations; writes are never auto-retried.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a remote customer record; returns the customer reference.
    async fn create_customer(&self, spec: &CustomerSpec) -> BillingResult<String>;

    /// Whether a stored customer reference is still live at the gateway.
    async fn customer_exists(&self, customer_ref: &str) -> BillingResult<bool>;

    /// Open a hosted checkout session of the requested mode.
    async fn create_checkout_session(&self, spec: &SessionSpec) -> BillingResult<SessionHandle>;

    /// Fetch a payment by transaction reference.
    async fn fetch_payment(&self, txn_ref: &str) -> BillingResult<PaymentView>;

    /// Fetch a checkout session by id.
    async fn fetch_checkout_session(&self, session_id: &str) -> BillingResult<SessionView>;

    /// Fetch a recurring subscription by reference.
    async fn fetch_subscription(&self, sub_ref: &str) -> BillingResult<GatewaySubscriptionView>;

    /// Fetch the canonical price record.
    async fn fetch_price(&self, price_ref: &str) -> BillingResult<PriceView>;

    /// Existing refund against a charge or payment intent, if any.
    async fn find_refund_for(&self, reference: &str) -> BillingResult<Option<String>>;

    /// Create a refund; returns the refund reference.
    async fn create_refund(&self, spec: &RefundSpec) -> BillingResult<String>;

    /// Most recent charges for a customer, newest first.
    async fn recent_charges(
        &self,
        customer_ref: &str,
        limit: u8,
    ) -> BillingResult<Vec<ChargeView>>;

    /// Move a subscription item from one price to another, without proration.
    /// The new price takes effect at the next renewal.
    async fn update_subscription_price(
        &self,
        sub_ref: &str,
        old_price_ref: &str,
        new_price_ref: &str,
    ) -> BillingResult<()>;

    /// Whether a reference names a payment transaction a refund can target.
    /// Reference formats are gateway-specific; the engine never inspects
    /// them itself.
    fn is_transaction_ref(&self, reference: &str) -> bool;

    /// Whether a reference names a settled charge.
    fn is_charge_ref(&self, reference: &str) -> bool;

    /// Verify an event's authenticity signature and return the raw envelope.
    fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<EventEnvelope>;
}
