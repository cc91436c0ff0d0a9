//! Payment-verified activation
//!
//! The single state machine through which every entitlement change flows,
//! whether triggered by the post-checkout confirm call, a webhook delivery,
//! or a manual replay. The sequence is always: idempotency check, fresh
//! gateway verification, atomic local commit, compensation on commit
//! failure. Webhook payload contents are never trusted; everything is
//! re-fetched by reference.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::checkout::addon_by_id;
use crate::compensator::{Compensator, FailedCommit};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CheckoutMetadata, PaymentGateway, PurchaseKind, SessionView};
use crate::idempotency::IdempotencyLedger;
use crate::notify::{BillingNotice, NotificationSink};
use crate::store::{ActivationCommit, EntitlementStore};
use crate::types::{
    AccountProfile, BillingCycle, NewPayment, PaymentStatus, Plan, QuotaUsage, Subscription,
};

#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    /// A new term was committed.
    Activated(Subscription),
    /// This payment reference was already processed; nothing changed.
    AlreadyProcessed(Subscription),
}

impl ActivationOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            ActivationOutcome::Activated(sub) => sub,
            ActivationOutcome::AlreadyProcessed(sub) => sub,
        }
    }
}

pub struct ActivationService {
    store: Arc<dyn EntitlementStore>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<IdempotencyLedger>,
    compensator: Compensator,
    sink: Arc<dyn NotificationSink>,
}

impl ActivationService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<IdempotencyLedger>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let compensator = Compensator::new(store.clone(), gateway.clone(), sink.clone());
        Self {
            store,
            gateway,
            ledger,
            compensator,
            sink,
        }
    }

    /// Activate whatever a completed checkout session paid for.
    ///
    /// Entry point for both the frontend confirm call and the
    /// `checkout.session.completed` webhook; replays of either are no-ops.
    pub async fn activate_session(&self, session_id: &str) -> BillingResult<ActivationOutcome> {
        let session = self.gateway.fetch_checkout_session(session_id).await?;
        let meta = CheckoutMetadata::from_map(&session.metadata)?;
        let profile = self
            .store
            .account_profile(meta.account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", meta.account_id)))?;

        // One-time sessions key idempotency on the payment reference;
        // subscription sessions without one fall back to the session id,
        // which is equally unique and stable.
        let key = session
            .payment_ref
            .clone()
            .unwrap_or_else(|| session.session_id.clone());

        if let Some(existing) = self.replay_outcome(&key).await? {
            tracing::info!(
                account_id = %meta.account_id,
                txn_ref = %key,
                "Duplicate activation attempt, returning existing state"
            );
            return Ok(existing);
        }

        if !session.paid {
            return Err(self
                .fail_verification(
                    &profile,
                    session.amount_total_cents.unwrap_or_default(),
                    &meta.plan_name,
                    Some(&key),
                    Some(session_id),
                    "checkout session is not paid",
                )
                .await);
        }

        let amount = session.amount_total_cents.ok_or_else(|| {
            BillingError::Verification("session reports no charged amount".to_string())
        })?;

        let outcome = match meta.kind {
            PurchaseKind::Plan | PurchaseKind::CustomPlan => {
                self.activate_plan(&profile, &meta, &session, amount, &key)
                    .await?
            }
            PurchaseKind::Addon => {
                self.apply_addon(&profile, &meta, amount, &key, session_id)
                    .await?
            }
        };

        self.ledger.record(&key);
        Ok(outcome)
    }

    /// Commit a renewal term after an `invoice.paid` delivery.
    ///
    /// `txn_ref` is the invoice's payment reference; the renewal is keyed on
    /// it so duplicate deliveries are no-ops.
    pub async fn renew(&self, sub_ref: &str, txn_ref: &str) -> BillingResult<ActivationOutcome> {
        if let Some(existing) = self.replay_outcome(txn_ref).await? {
            tracing::info!(
                subscription_ref = %sub_ref,
                txn_ref = %txn_ref,
                "Duplicate renewal delivery, returning existing state"
            );
            return Ok(existing);
        }

        let local = self.store.subscription_by_gateway_ref(sub_ref).await?;
        let gsub = self.gateway.fetch_subscription(sub_ref).await?;

        // The local row is the authoritative owner mapping; session metadata
        // mirrored onto the gateway subscription covers first deliveries that
        // race ahead of checkout confirmation.
        let (account_id, plan_name, cycle) = match &local {
            Some(sub) => (sub.account_id, sub.plan_name.clone(), sub.billing_cycle),
            None => {
                let meta = CheckoutMetadata::from_map(&gsub.metadata)?;
                (meta.account_id, meta.plan_name, meta.billing_cycle)
            }
        };
        let profile = self
            .store
            .account_profile(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;

        let payment = self.gateway.fetch_payment(txn_ref).await?;
        if !payment.status.is_terminal_success() {
            return Err(self
                .fail_verification(
                    &profile,
                    payment.amount_cents,
                    &plan_name,
                    Some(txn_ref),
                    None,
                    "renewal payment is not in a successful terminal state",
                )
                .await);
        }

        let plan = self
            .store
            .plan_by_name(&plan_name)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(plan_name.clone()))?;

        if payment.amount_cents != plan.price_cents(cycle) {
            return Err(self
                .fail_verification(
                    &profile,
                    payment.amount_cents,
                    &plan_name,
                    Some(txn_ref),
                    None,
                    &format!(
                        "charged amount {} does not match plan price {}",
                        payment.amount_cents,
                        plan.price_cents(cycle)
                    ),
                )
                .await);
        }

        let start = unix_to_datetime(gsub.period_start_unix);
        let end = unix_to_datetime(gsub.period_end_unix);

        let subscription = self
            .commit_term(
                &profile,
                &plan,
                cycle,
                payment.amount_cents,
                start,
                end,
                Some(end),
                true,
                Some(sub_ref.to_string()),
                gsub.price_ref.clone(),
                gsub.product_ref.clone(),
                txn_ref,
                None,
                payment.charge_ref.clone(),
                payment.customer_ref.clone(),
            )
            .await?;

        self.ledger.record(txn_ref);
        Ok(subscription)
    }

    /// A renewal charge failed: suspend auto-renew and flag the owner
    /// past-due. Entitlements stay until the paid-through date.
    pub async fn renewal_failed(&self, sub_ref: &str, failure_reason: &str) -> BillingResult<()> {
        let Some(local) = self.store.subscription_by_gateway_ref(sub_ref).await? else {
            tracing::warn!(
                subscription_ref = %sub_ref,
                "Renewal failure for unknown subscription, ignoring"
            );
            return Ok(());
        };

        let payer_name = self
            .store
            .account_profile(local.account_id)
            .await?
            .map(|p| p.display_name)
            .unwrap_or_default();

        self.store
            .mark_past_due(
                local.account_id,
                NewPayment {
                    account_id: local.account_id,
                    subscription_id: Some(local.id),
                    amount_cents: local.price_cents,
                    status: PaymentStatus::Failed,
                    gateway_txn_ref: None,
                    gateway_session_ref: None,
                    refund_ref: None,
                    failure_reason: Some(failure_reason.to_string()),
                    plan_name: local.plan_name.clone(),
                    payer_name,
                },
            )
            .await?;

        self.sink
            .notify(BillingNotice::RenewalFailed {
                account_id: local.account_id,
                plan_name: local.plan_name,
                failure_reason: failure_reason.to_string(),
            })
            .await;

        Ok(())
    }

    /// The gateway subscription was deleted: record cancellation locally.
    pub async fn cancel(&self, sub_ref: &str) -> BillingResult<()> {
        let Some(local) = self.store.subscription_by_gateway_ref(sub_ref).await? else {
            tracing::warn!(
                subscription_ref = %sub_ref,
                "Cancellation for unknown subscription, ignoring"
            );
            return Ok(());
        };
        if local.canceled_at.is_some() {
            return Ok(());
        }

        self.store
            .mark_canceled(local.account_id, OffsetDateTime::now_utc())
            .await?;

        self.sink
            .notify(BillingNotice::SubscriptionCanceled {
                account_id: local.account_id,
                plan_name: local.plan_name,
            })
            .await;

        Ok(())
    }

    async fn activate_plan(
        &self,
        profile: &AccountProfile,
        meta: &CheckoutMetadata,
        session: &SessionView,
        amount: i64,
        key: &str,
    ) -> BillingResult<ActivationOutcome> {
        let plan = self
            .store
            .plan_by_name(&meta.plan_name)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(meta.plan_name.clone()))?;

        let custom_expected = meta.kind == PurchaseKind::CustomPlan;
        if plan.is_custom != custom_expected {
            return Err(self
                .fail_verification(
                    profile,
                    amount,
                    &plan.name,
                    Some(key),
                    Some(&session.session_id),
                    "purchase kind does not match the plan",
                )
                .await);
        }

        // Exact amount equality in minor units; anything else is rejected
        // and recorded, never rounded.
        if amount != plan.price_cents(meta.billing_cycle) {
            return Err(self
                .fail_verification(
                    profile,
                    amount,
                    &plan.name,
                    Some(key),
                    Some(&session.session_id),
                    &format!(
                        "charged amount {} does not match plan price {}",
                        amount,
                        plan.price_cents(meta.billing_cycle)
                    ),
                )
                .await);
        }

        let now = OffsetDateTime::now_utc();
        let (start, end, renewal, auto_renew, price_ref, product_ref) =
            match &session.subscription_ref {
                Some(sub_ref) => {
                    let gsub = self.gateway.fetch_subscription(sub_ref).await?;
                    if let (Some(expected), Some(actual)) =
                        (&meta.expected_price_ref, &gsub.price_ref)
                    {
                        if expected != actual {
                            return Err(self
                                .fail_verification(
                                    profile,
                                    amount,
                                    &plan.name,
                                    Some(key),
                                    Some(&session.session_id),
                                    "subscription is on an unexpected price",
                                )
                                .await);
                        }
                    }
                    let end = unix_to_datetime(gsub.period_end_unix);
                    (
                        unix_to_datetime(gsub.period_start_unix),
                        end,
                        Some(end),
                        true,
                        gsub.price_ref.clone(),
                        gsub.product_ref.clone(),
                    )
                }
                // One-time custom plans grant a fixed local term.
                None => (
                    now,
                    now + meta.billing_cycle.term(),
                    None,
                    false,
                    None,
                    plan.gateway_product_ref.clone(),
                ),
            };

        self.commit_term(
            profile,
            &plan,
            meta.billing_cycle,
            amount,
            start,
            end,
            renewal,
            auto_renew,
            session.subscription_ref.clone(),
            price_ref,
            product_ref,
            key,
            Some(&session.session_id),
            None,
            session.customer_ref.clone(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_term(
        &self,
        profile: &AccountProfile,
        plan: &Plan,
        cycle: BillingCycle,
        amount: i64,
        start: OffsetDateTime,
        end: OffsetDateTime,
        renewal: Option<OffsetDateTime>,
        auto_renew: bool,
        gateway_subscription_ref: Option<String>,
        gateway_price_ref: Option<String>,
        gateway_product_ref: Option<String>,
        txn_ref: &str,
        session_ref: Option<&str>,
        charge_ref: Option<String>,
        customer_ref: Option<String>,
    ) -> BillingResult<ActivationOutcome> {
        let previous = self.store.subscription_by_owner(profile.id).await?;
        let quotas = QuotaUsage::for_new_term(&plan.quotas, previous.as_ref().map(|s| &s.quotas));

        let commit = ActivationCommit {
            account_id: profile.id,
            plan_name: plan.name.clone(),
            price_cents: amount,
            billing_cycle: cycle,
            start_date: start,
            end_date: end,
            renewal_date: renewal,
            auto_renew,
            gateway_subscription_ref,
            gateway_price_ref,
            gateway_product_ref,
            quotas,
            payment: NewPayment {
                account_id: profile.id,
                subscription_id: None,
                amount_cents: amount,
                status: PaymentStatus::Success,
                gateway_txn_ref: Some(txn_ref.to_string()),
                gateway_session_ref: session_ref.map(|s| s.to_string()),
                refund_ref: None,
                failure_reason: None,
                plan_name: plan.name.clone(),
                payer_name: profile.display_name.clone(),
            },
        };

        match self.store.commit_activation(commit).await {
            Ok(subscription) => {
                tracing::info!(
                    account_id = %profile.id,
                    plan = %plan.name,
                    txn_ref = %txn_ref,
                    end_date = %end,
                    "Activated subscription term"
                );
                self.sink
                    .notify(BillingNotice::ActivationCompleted {
                        account_id: profile.id,
                        plan_name: plan.name.clone(),
                        amount_cents: amount,
                    })
                    .await;
                Ok(ActivationOutcome::Activated(subscription))
            }
            // The same transaction reference won a concurrent commit; this
            // attempt is a replay, not a new charge.
            Err(BillingError::ConcurrentModification(_)) => {
                match self.replay_outcome(txn_ref).await? {
                    Some(outcome) => Ok(outcome),
                    None => Err(BillingError::ConcurrentModification(
                        "activation race lost and no committed state found".to_string(),
                    )),
                }
            }
            Err(e) => {
                let failed = FailedCommit {
                    account_id: profile.id,
                    amount_cents: amount,
                    txn_ref: Some(txn_ref.to_string())
                        .filter(|r| self.gateway.is_transaction_ref(r)),
                    charge_ref,
                    customer_ref,
                    plan_name: plan.name.clone(),
                    payer_name: profile.display_name.clone(),
                    cause: e.to_string(),
                };
                Err(self.compensator.compensate(failed).await)
            }
        }
    }

    async fn apply_addon(
        &self,
        profile: &AccountProfile,
        meta: &CheckoutMetadata,
        amount: i64,
        key: &str,
        session_id: &str,
    ) -> BillingResult<ActivationOutcome> {
        let offer = meta
            .addon_id
            .as_deref()
            .and_then(addon_by_id)
            .ok_or_else(|| {
                BillingError::Verification("session references an unknown add-on".to_string())
            })?;

        if amount != offer.price_cents {
            return Err(self
                .fail_verification(
                    profile,
                    amount,
                    offer.id,
                    Some(key),
                    Some(session_id),
                    &format!(
                        "charged amount {} does not match add-on price {}",
                        amount, offer.price_cents
                    ),
                )
                .await);
        }

        let payment = NewPayment {
            account_id: profile.id,
            subscription_id: None,
            amount_cents: amount,
            status: PaymentStatus::Success,
            gateway_txn_ref: Some(key.to_string()),
            gateway_session_ref: Some(session_id.to_string()),
            refund_ref: None,
            failure_reason: None,
            plan_name: offer.id.to_string(),
            payer_name: profile.display_name.clone(),
        };

        match self
            .store
            .apply_quota_topup(profile.id, offer.grants, payment)
            .await
        {
            Ok(subscription) => {
                tracing::info!(
                    account_id = %profile.id,
                    addon = %offer.id,
                    txn_ref = %key,
                    "Applied quota top-up"
                );
                self.sink
                    .notify(BillingNotice::ActivationCompleted {
                        account_id: profile.id,
                        plan_name: offer.id.to_string(),
                        amount_cents: amount,
                    })
                    .await;
                Ok(ActivationOutcome::Activated(subscription))
            }
            Err(BillingError::ConcurrentModification(_)) => {
                match self.replay_outcome(key).await? {
                    Some(outcome) => Ok(outcome),
                    None => Err(BillingError::ConcurrentModification(
                        "top-up race lost and no committed state found".to_string(),
                    )),
                }
            }
            // Paid for a top-up with no live subscription to extend, or the
            // commit failed: either way the money goes back.
            Err(e) => {
                let failed = FailedCommit {
                    account_id: profile.id,
                    amount_cents: amount,
                    txn_ref: Some(key.to_string())
                        .filter(|r| self.gateway.is_transaction_ref(r)),
                    charge_ref: None,
                    customer_ref: profile.gateway_customer_ref.clone(),
                    plan_name: offer.id.to_string(),
                    payer_name: profile.display_name.clone(),
                    cause: e.to_string(),
                };
                Err(self.compensator.compensate(failed).await)
            }
        }
    }

    /// Committed outcome for a previously processed reference, if any.
    async fn replay_outcome(&self, key: &str) -> BillingResult<Option<ActivationOutcome>> {
        // The ledger is a hint; the payment table is authoritative.
        let payment = match self.store.find_success_payment(key).await? {
            Some(payment) => payment,
            None => return Ok(None),
        };

        if payment.status == PaymentStatus::PendingRefund {
            return Err(BillingError::ActivationRefunded(
                "this payment was refunded after a failed activation".to_string(),
            ));
        }

        let subscription = self
            .store
            .subscription_by_owner(payment.account_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "payment {} is recorded but no subscription exists",
                    key
                ))
            })?;
        Ok(Some(ActivationOutcome::AlreadyProcessed(subscription)))
    }

    /// Record the rejected claim and build the error. Verification failures
    /// never trigger refunds; no charge has been confirmed as ours.
    async fn fail_verification(
        &self,
        profile: &AccountProfile,
        amount: i64,
        plan_name: &str,
        txn_ref: Option<&str>,
        session_ref: Option<&str>,
        reason: &str,
    ) -> BillingError {
        tracing::warn!(
            account_id = %profile.id,
            plan = %plan_name,
            amount_cents = amount,
            reason = %reason,
            "Payment verification failed"
        );

        // One audit row per reference per ledger window; a client hammering
        // confirm with the same rejected claim only logs after the first.
        let already_recorded = txn_ref.is_some_and(|r| self.ledger.seen(r));
        if !already_recorded {
            let row = NewPayment {
                account_id: profile.id,
                subscription_id: None,
                amount_cents: amount,
                status: PaymentStatus::Failed,
                gateway_txn_ref: txn_ref.map(|s| s.to_string()),
                gateway_session_ref: session_ref.map(|s| s.to_string()),
                refund_ref: None,
                failure_reason: Some(reason.to_string()),
                plan_name: plan_name.to_string(),
                payer_name: profile.display_name.clone(),
            };
            if let Err(e) = self.store.record_payment(row).await {
                tracing::error!(
                    account_id = %profile.id,
                    error = %e,
                    "Failed to record verification failure"
                );
            }
            if let Some(r) = txn_ref {
                self.ledger.record(r);
            }
        }

        BillingError::Verification(reason.to_string())
    }
}

fn unix_to_datetime(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or_else(|_| OffsetDateTime::now_utc())
}
