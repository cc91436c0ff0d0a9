// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Activation commits carry many verified fields
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Bidcraft subscription reconciliation engine
//!
//! Keeps local entitlement state (plans, subscriptions, payments) in
//! agreement with an external payment gateway that actually moves money.
//!
//! ## Guarantees
//!
//! - **Verification before entitlement**: every activation re-fetches
//!   payment state from the gateway and checks amount, owner, and purchase
//!   metadata before committing anything locally
//! - **Idempotent replays**: confirm calls and webhook deliveries can be
//!   repeated without double-granting or double-charging
//! - **Compensation**: a verified charge whose local commit fails is
//!   refunded automatically, or escalated when it cannot be
//! - **Price sync**: gateway price changes propagate to plans and migrate
//!   live recurring subscriptions, without rewriting snapshotted terms

pub mod activation;
pub mod checkout;
pub mod compensator;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod memory;
pub mod notify;
pub mod pg;
pub mod store;
pub mod stripe_gateway;
pub mod sync;
pub mod types;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

pub use activation::{ActivationOutcome, ActivationService};
pub use checkout::{addon_by_id, AddonOffer, CheckoutResponse, CheckoutService, ADDON_OFFERS};
pub use compensator::{Compensator, FailedCommit};
pub use error::{BillingError, BillingResult};
pub use gateway::{
    CheckoutMetadata, CustomerSpec, EventEnvelope, GatewayPaymentStatus, GatewaySubscriptionView,
    PaymentGateway, PaymentView, PriceView, PurchaseKind, RefundSpec, SessionHandle, SessionMode,
    SessionSpec, SessionView,
};
pub use idempotency::IdempotencyLedger;
pub use memory::MemoryStore;
pub use notify::{BillingNotice, NotificationSink, TracingSink};
pub use pg::PgStore;
pub use store::{ActivationCommit, EntitlementStore};
pub use stripe_gateway::{StripeConfig, StripeGateway};
pub use sync::{PriceSyncService, SyncReport};
pub use types::{
    carry_forward, AccountProfile, BillingCycle, NewPayment, Payment, PaymentStatus, Plan,
    QuotaCounter, QuotaSet, QuotaUsage, Subscription,
};
pub use webhooks::{EventClass, WebhookDispatcher};

use sqlx::PgPool;
use std::sync::Arc;

/// Wires the engine together over a chosen store, gateway, and sink.
pub struct BillingService {
    pub checkout: CheckoutService,
    pub activation: Arc<ActivationService>,
    pub sync: Arc<PriceSyncService>,
    pub webhooks: WebhookDispatcher,
    pub store: Arc<dyn EntitlementStore>,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn PaymentGateway>,
        sink: Arc<dyn NotificationSink>,
        success_url: String,
        cancel_url: String,
    ) -> Self {
        let ledger = Arc::new(IdempotencyLedger::default());
        let activation = Arc::new(ActivationService::new(
            store.clone(),
            gateway.clone(),
            ledger,
            sink,
        ));
        let sync = Arc::new(PriceSyncService::new(store.clone(), gateway.clone()));
        let webhooks = WebhookDispatcher::new(
            gateway.clone(),
            store.clone(),
            activation.clone(),
            sync.clone(),
        );
        let checkout = CheckoutService::new(store.clone(), gateway, success_url, cancel_url);

        Self {
            checkout,
            activation,
            sync,
            webhooks,
            store,
        }
    }

    /// Production wiring: Stripe gateway and Postgres store, configured
    /// from the environment.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = StripeGateway::from_env()?;
        let success_url = gateway.config().success_url.clone();
        let cancel_url = gateway.config().cancel_url.clone();

        Ok(Self::new(
            Arc::new(PgStore::new(pool)),
            Arc::new(gateway),
            Arc::new(TracingSink),
            success_url,
            cancel_url,
        ))
    }
}
