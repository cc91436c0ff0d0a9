//! In-memory entitlement store
//!
//! Same atomicity contract as the Postgres store: one mutex held across each
//! logical operation is the commit point. Used by the engine's tests and by
//! local tooling that runs without a database.

use std::collections::HashMap;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use async_trait::async_trait;
use bidcraft_shared::BillingStatus;

use crate::error::{BillingError, BillingResult};
use crate::store::{ActivationCommit, EntitlementStore};
use crate::types::{
    AccountProfile, BillingCycle, NewPayment, Payment, PaymentStatus, Plan, QuotaSet, QuotaUsage,
    Subscription,
};

/// Stuck "processing" claims older than this may be re-claimed.
const CLAIM_RECOVERY: Duration = Duration::minutes(30);

#[derive(Debug, Clone)]
struct EventRecord {
    #[allow(dead_code)]
    event_type: String,
    result: String,
    error_message: Option<String>,
    started_at: OffsetDateTime,
}

#[derive(Default)]
struct World {
    plans: HashMap<String, Plan>,
    accounts: HashMap<Uuid, AccountProfile>,
    subscriptions: HashMap<Uuid, Subscription>,
    payments: Vec<Payment>,
    events: HashMap<String, EventRecord>,
    /// Injected commit failures remaining (compensation-path testing).
    fail_commits: u32,
    /// Injected finish_event failures remaining.
    fail_finishes: u32,
}

/// Mutex-backed store. Cheap to clone via `Arc` at the call sites.
pub struct MemoryStore {
    world: Mutex<World>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            world: Mutex::new(World::default()),
        }
    }

    pub async fn insert_plan(&self, plan: Plan) {
        let mut world = self.world.lock().await;
        world.plans.insert(plan.name.clone(), plan);
    }

    pub async fn insert_account(&self, profile: AccountProfile) {
        let mut world = self.world.lock().await;
        world.accounts.insert(profile.id, profile);
    }

    /// All payment rows for an account, oldest first.
    pub async fn payments_for(&self, account_id: Uuid) -> Vec<Payment> {
        let world = self.world.lock().await;
        world
            .payments
            .iter()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Fail the next `n` activation/top-up commits with a database error.
    pub async fn inject_commit_failures(&self, n: u32) {
        let mut world = self.world.lock().await;
        world.fail_commits = n;
    }

    /// Fail the next `n` event bookkeeping writes with a database error.
    pub async fn inject_finish_failures(&self, n: u32) {
        let mut world = self.world.lock().await;
        world.fail_finishes = n;
    }

    fn append_payment(world: &mut World, new: NewPayment) -> Payment {
        let payment = Payment {
            id: Uuid::new_v4(),
            account_id: new.account_id,
            subscription_id: new.subscription_id,
            amount_cents: new.amount_cents,
            status: new.status,
            gateway_txn_ref: new.gateway_txn_ref,
            gateway_session_ref: new.gateway_session_ref,
            refund_ref: new.refund_ref,
            failure_reason: new.failure_reason,
            plan_name: new.plan_name,
            payer_name: new.payer_name,
            paid_at: OffsetDateTime::now_utc(),
        };
        world.payments.push(payment.clone());
        payment
    }

    fn set_status(world: &mut World, account_id: Uuid, status: BillingStatus) {
        if let Some(profile) = world.accounts.get_mut(&account_id) {
            profile.billing_status = status;
        }
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn plan_by_name(&self, name: &str) -> BillingResult<Option<Plan>> {
        let world = self.world.lock().await;
        Ok(world.plans.get(name).cloned())
    }

    async fn plans_by_product_ref(&self, product_ref: &str) -> BillingResult<Vec<Plan>> {
        let world = self.world.lock().await;
        Ok(world
            .plans
            .values()
            .filter(|p| p.gateway_product_ref.as_deref() == Some(product_ref))
            .cloned()
            .collect())
    }

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let world = self.world.lock().await;
        Ok(world
            .plans
            .values()
            .filter(|p| p.is_active && !p.is_custom)
            .cloned()
            .collect())
    }

    async fn update_plan_price(
        &self,
        plan_name: &str,
        cycle: BillingCycle,
        amount_cents: i64,
        price_ref: &str,
    ) -> BillingResult<()> {
        let mut world = self.world.lock().await;
        let plan = world
            .plans
            .get_mut(plan_name)
            .ok_or_else(|| BillingError::PlanNotFound(plan_name.to_string()))?;
        match cycle {
            BillingCycle::Monthly => {
                plan.monthly_price_cents = amount_cents;
                plan.gateway_price_monthly = Some(price_ref.to_string());
            }
            BillingCycle::Yearly => {
                plan.yearly_price_cents = amount_cents;
                plan.gateway_price_yearly = Some(price_ref.to_string());
            }
        }
        Ok(())
    }

    async fn account_profile(&self, account_id: Uuid) -> BillingResult<Option<AccountProfile>> {
        let world = self.world.lock().await;
        Ok(world.accounts.get(&account_id).cloned())
    }

    async fn set_customer_ref(&self, account_id: Uuid, customer_ref: &str) -> BillingResult<()> {
        let mut world = self.world.lock().await;
        let profile = world
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;
        profile.gateway_customer_ref = Some(customer_ref.to_string());
        Ok(())
    }

    async fn find_success_payment(&self, txn_ref: &str) -> BillingResult<Option<Payment>> {
        let world = self.world.lock().await;
        Ok(world
            .payments
            .iter()
            .find(|p| {
                matches!(
                    p.status,
                    PaymentStatus::Success | PaymentStatus::PendingRefund
                ) && p.gateway_txn_ref.as_deref() == Some(txn_ref)
            })
            .cloned())
    }

    async fn record_payment(&self, payment: NewPayment) -> BillingResult<Payment> {
        let mut world = self.world.lock().await;
        Ok(Self::append_payment(&mut world, payment))
    }

    async fn append_refund(&self, txn_ref: &str, refund_ref: &str) -> BillingResult<bool> {
        let mut world = self.world.lock().await;
        for payment in world.payments.iter_mut() {
            if payment.status == PaymentStatus::Success
                && payment.gateway_txn_ref.as_deref() == Some(txn_ref)
            {
                payment.refund_ref = Some(refund_ref.to_string());
                payment.status = PaymentStatus::PendingRefund;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_session_payment_failed(
        &self,
        session_ref: &str,
        reason: &str,
    ) -> BillingResult<bool> {
        let mut world = self.world.lock().await;
        for payment in world.payments.iter_mut() {
            if payment.status == PaymentStatus::Pending
                && payment.gateway_session_ref.as_deref() == Some(session_ref)
            {
                payment.status = PaymentStatus::Failed;
                payment.failure_reason = Some(reason.to_string());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn subscription_by_owner(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let world = self.world.lock().await;
        Ok(world.subscriptions.get(&account_id).cloned())
    }

    async fn subscriptions_by_price_ref(
        &self,
        price_ref: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let world = self.world.lock().await;
        Ok(world
            .subscriptions
            .values()
            .filter(|s| {
                s.canceled_at.is_none() && s.gateway_price_ref.as_deref() == Some(price_ref)
            })
            .cloned()
            .collect())
    }

    async fn subscription_by_gateway_ref(
        &self,
        sub_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let world = self.world.lock().await;
        Ok(world
            .subscriptions
            .values()
            .find(|s| s.gateway_subscription_ref.as_deref() == Some(sub_ref))
            .cloned())
    }

    async fn set_subscription_price_ref(
        &self,
        subscription_id: Uuid,
        new_price_ref: &str,
    ) -> BillingResult<()> {
        let mut world = self.world.lock().await;
        for sub in world.subscriptions.values_mut() {
            if sub.id == subscription_id {
                sub.gateway_price_ref = Some(new_price_ref.to_string());
                return Ok(());
            }
        }
        Err(BillingError::NotFound(format!(
            "subscription {}",
            subscription_id
        )))
    }

    async fn commit_activation(&self, commit: ActivationCommit) -> BillingResult<Subscription> {
        let mut world = self.world.lock().await;

        if world.fail_commits > 0 {
            world.fail_commits -= 1;
            return Err(BillingError::Database(
                "injected commit failure".to_string(),
            ));
        }

        // Unique Success row per transaction reference; the loser of a race
        // surfaces a retryable conflict rather than double-activating.
        if let Some(txn_ref) = commit.payment.gateway_txn_ref.as_deref() {
            let duplicate = world.payments.iter().any(|p| {
                p.status == PaymentStatus::Success
                    && p.gateway_txn_ref.as_deref() == Some(txn_ref)
            });
            if duplicate {
                return Err(BillingError::ConcurrentModification(format!(
                    "transaction {} already recorded",
                    txn_ref
                )));
            }
        }

        if !world.accounts.contains_key(&commit.account_id) {
            return Err(BillingError::NotFound(format!(
                "account {}",
                commit.account_id
            )));
        }

        let existing_id = world
            .subscriptions
            .get(&commit.account_id)
            .map(|s| s.id);
        let subscription = Subscription {
            id: existing_id.unwrap_or_else(Uuid::new_v4),
            account_id: commit.account_id,
            plan_name: commit.plan_name.clone(),
            price_cents: commit.price_cents,
            billing_cycle: commit.billing_cycle,
            start_date: commit.start_date,
            end_date: commit.end_date,
            renewal_date: commit.renewal_date,
            auto_renew: commit.auto_renew,
            canceled_at: None,
            gateway_subscription_ref: commit.gateway_subscription_ref.clone(),
            gateway_price_ref: commit.gateway_price_ref.clone(),
            gateway_product_ref: commit.gateway_product_ref.clone(),
            quotas: commit.quotas,
        };
        world
            .subscriptions
            .insert(commit.account_id, subscription.clone());
        Self::set_status(&mut world, commit.account_id, BillingStatus::Active);

        let mut payment = commit.payment;
        payment.subscription_id = Some(subscription.id);
        Self::append_payment(&mut world, payment);

        Ok(subscription)
    }

    async fn mark_past_due(&self, account_id: Uuid, payment: NewPayment) -> BillingResult<()> {
        let mut world = self.world.lock().await;
        let sub = world
            .subscriptions
            .get_mut(&account_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription for {}", account_id)))?;
        sub.auto_renew = false;
        Self::set_status(&mut world, account_id, BillingStatus::PastDue);
        Self::append_payment(&mut world, payment);
        Ok(())
    }

    async fn mark_canceled(
        &self,
        account_id: Uuid,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut world = self.world.lock().await;
        let sub = world
            .subscriptions
            .get_mut(&account_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription for {}", account_id)))?;
        sub.canceled_at = Some(canceled_at);
        sub.auto_renew = false;
        Self::set_status(&mut world, account_id, BillingStatus::Inactive);
        Ok(())
    }

    async fn apply_quota_topup(
        &self,
        account_id: Uuid,
        add: QuotaSet,
        payment: NewPayment,
    ) -> BillingResult<Subscription> {
        let mut world = self.world.lock().await;

        if world.fail_commits > 0 {
            world.fail_commits -= 1;
            return Err(BillingError::Database(
                "injected commit failure".to_string(),
            ));
        }

        // Same single-Success-row rule as commit_activation; a racing
        // duplicate of the same transaction must not double-apply quotas.
        if let Some(txn_ref) = payment.gateway_txn_ref.as_deref() {
            let duplicate = world.payments.iter().any(|p| {
                p.status == PaymentStatus::Success
                    && p.gateway_txn_ref.as_deref() == Some(txn_ref)
            });
            if duplicate {
                return Err(BillingError::ConcurrentModification(format!(
                    "transaction {} already recorded",
                    txn_ref
                )));
            }
        }

        let now = OffsetDateTime::now_utc();
        let sub = world
            .subscriptions
            .get_mut(&account_id)
            .filter(|s| s.is_live(now))
            .ok_or_else(|| {
                BillingError::NotFound(format!("live subscription for {}", account_id))
            })?;

        sub.quotas.editor_seats.max = sub.quotas.editor_seats.max.saturating_add(add.editor_seats);
        sub.quotas.viewer_seats.max = sub.quotas.viewer_seats.max.saturating_add(add.viewer_seats);
        sub.quotas.rfp_credits.max = sub.quotas.rfp_credits.max.saturating_add(add.rfp_credits);
        sub.quotas.grant_credits.max =
            sub.quotas.grant_credits.max.saturating_add(add.grant_credits);
        let updated = sub.clone();

        let mut payment = payment;
        payment.subscription_id = Some(updated.id);
        Self::append_payment(&mut world, payment);

        Ok(updated)
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let _ = event_timestamp;
        let mut world = self.world.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(record) = world.events.get(event_id) {
            let stuck =
                record.result == "processing" && now - record.started_at > CLAIM_RECOVERY;
            if !stuck {
                return Ok(false);
            }
        }
        world.events.insert(
            event_id.to_string(),
            EventRecord {
                event_type: event_type.to_string(),
                result: "processing".to_string(),
                error_message: None,
                started_at: now,
            },
        );
        Ok(true)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut world = self.world.lock().await;
        if world.fail_finishes > 0 {
            world.fail_finishes -= 1;
            return Err(BillingError::Database(
                "injected finish failure".to_string(),
            ));
        }
        if let Some(record) = world.events.get_mut(event_id) {
            record.result = if success { "success" } else { "error" }.to_string();
            record.error_message = error_message.map(|s| s.to_string());
        }
        Ok(())
    }
}
