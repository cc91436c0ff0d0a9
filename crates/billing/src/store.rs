//! Entitlement store port
//!
//! Coarse-grained operations over the local entitlement state. Every
//! multi-entity operation is atomic in every implementation: `PgStore` runs
//! it in one transaction with a single commit point, `MemoryStore` holds one
//! mutex across it. Owner `billing_status` is written only inside these
//! operations, never anywhere else.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::types::{
    AccountProfile, BillingCycle, NewPayment, Payment, Plan, QuotaSet, QuotaUsage, Subscription,
};

/// Everything the activation transaction commits at once: the subscription
/// upsert, the owner status flip to active, and the Success payment row.
#[derive(Debug, Clone)]
pub struct ActivationCommit {
    pub account_id: Uuid,
    pub plan_name: String,
    pub price_cents: i64,
    pub billing_cycle: BillingCycle,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    pub renewal_date: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub gateway_subscription_ref: Option<String>,
    pub gateway_price_ref: Option<String>,
    pub gateway_product_ref: Option<String>,
    pub quotas: QuotaUsage,
    pub payment: NewPayment,
}

/// Transactional store for Plan, Subscription, Payment and account billing
/// fields.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    // Plans (read-mostly; prices written only by sync/admin)

    async fn plan_by_name(&self, name: &str) -> BillingResult<Option<Plan>>;

    async fn plans_by_product_ref(&self, product_ref: &str) -> BillingResult<Vec<Plan>>;

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>>;

    /// Update one cycle's price and gateway price reference on a plan.
    async fn update_plan_price(
        &self,
        plan_name: &str,
        cycle: BillingCycle,
        amount_cents: i64,
        price_ref: &str,
    ) -> BillingResult<()>;

    // Accounts

    async fn account_profile(&self, account_id: Uuid) -> BillingResult<Option<AccountProfile>>;

    async fn set_customer_ref(&self, account_id: Uuid, customer_ref: &str) -> BillingResult<()>;

    // Payments

    /// Existing `Success` payment for an external transaction reference.
    /// The authoritative idempotency check.
    async fn find_success_payment(&self, txn_ref: &str) -> BillingResult<Option<Payment>>;

    /// Append an audit row outside any larger transaction (failed attempts,
    /// compensation records, pending pre-activation rows).
    async fn record_payment(&self, payment: NewPayment) -> BillingResult<Payment>;

    /// Append a refund reference to a `Success` row; status becomes
    /// `PendingRefund`. Returns false when no such row exists.
    async fn append_refund(&self, txn_ref: &str, refund_ref: &str) -> BillingResult<bool>;

    /// Mark the `Pending` payment for a checkout session as `Failed`
    /// (session expired or abandoned). Returns false when nothing matched.
    async fn mark_session_payment_failed(
        &self,
        session_ref: &str,
        reason: &str,
    ) -> BillingResult<bool>;

    // Subscriptions

    async fn subscription_by_owner(&self, account_id: Uuid)
        -> BillingResult<Option<Subscription>>;

    async fn subscriptions_by_price_ref(&self, price_ref: &str)
        -> BillingResult<Vec<Subscription>>;

    /// Local subscription owning a recurring gateway subscription, if any.
    /// The authoritative mapping for lifecycle events that arrive keyed by
    /// gateway reference.
    async fn subscription_by_gateway_ref(
        &self,
        sub_ref: &str,
    ) -> BillingResult<Option<Subscription>>;

    async fn set_subscription_price_ref(
        &self,
        subscription_id: Uuid,
        new_price_ref: &str,
    ) -> BillingResult<()>;

    /// The activation commit: upsert the subscription keyed by owner, set
    /// owner status active, insert the Success payment row. One atomic
    /// commit; concurrent commits for the same owner serialize here, and the
    /// loser surfaces `ConcurrentModification`.
    async fn commit_activation(&self, commit: ActivationCommit) -> BillingResult<Subscription>;

    /// active -> past_due: clear auto-renew, set owner status past_due,
    /// append the Failed payment row. Safe to re-apply for an already
    /// past-due subscription.
    async fn mark_past_due(&self, account_id: Uuid, payment: NewPayment) -> BillingResult<()>;

    /// active -> canceled: set cancellation timestamp, clear auto-renew, set
    /// owner status inactive.
    async fn mark_canceled(
        &self,
        account_id: Uuid,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Add-on top-up: increase `max_*` counters on the existing live
    /// subscription and append the Success payment row. Never touches dates
    /// or plan identity. Errors with `NotFound` when no live subscription
    /// exists (the caller refunds instead of silently dropping).
    async fn apply_quota_topup(
        &self,
        account_id: Uuid,
        add: QuotaSet,
        payment: NewPayment,
    ) -> BillingResult<Subscription>;

    // Webhook event idempotency

    /// Atomically claim exclusive processing rights for an event id.
    /// Returns false for duplicates, unless the previous claim has been
    /// stuck in processing beyond the recovery timeout.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Record the processing outcome for a claimed event.
    async fn finish_event(
        &self,
        event_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}
