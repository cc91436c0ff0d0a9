//! Compensating refunds
//!
//! Invoked only when the gateway confirmed a successful charge and the local
//! activation commit then failed. Never invoked on timeouts or unverified
//! payments; an unknown gateway outcome must not be refunded automatically.
//!
//! The audit row write is best effort: a failed audit write is logged and
//! swallowed, it never turns an issued refund back into an error path that
//! could trigger a second refund.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentGateway, RefundSpec};
use crate::notify::{BillingNotice, NotificationSink};
use crate::store::EntitlementStore;
use crate::types::{NewPayment, PaymentStatus};

/// Charges older than this are never matched by amount during best-effort
/// reference resolution.
const CHARGE_MATCH_WINDOW_SECS: i64 = 3600;

/// A verified charge whose local commit failed.
#[derive(Debug, Clone)]
pub struct FailedCommit {
    pub account_id: Uuid,
    pub amount_cents: i64,
    pub txn_ref: Option<String>,
    pub charge_ref: Option<String>,
    pub customer_ref: Option<String>,
    pub plan_name: String,
    pub payer_name: String,
    /// The store error that made the activation unrecoverable.
    pub cause: String,
}

pub struct Compensator {
    store: Arc<dyn EntitlementStore>,
    gateway: Arc<dyn PaymentGateway>,
    sink: Arc<dyn NotificationSink>,
}

impl Compensator {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn PaymentGateway>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            gateway,
            sink,
        }
    }

    /// Refund the orphaned charge and return the error the caller surfaces.
    ///
    /// `ActivationRefunded` when money went back, `CompensationRequired`
    /// when it could not and an operator must step in.
    pub async fn compensate(&self, failed: FailedCommit) -> BillingError {
        tracing::error!(
            account_id = %failed.account_id,
            amount_cents = failed.amount_cents,
            cause = %failed.cause,
            "Activation commit failed after verified payment, compensating"
        );

        let reference = match self.resolve_reference(&failed).await {
            Some(reference) => reference,
            None => {
                return self
                    .manual_intervention(&failed, "no refundable reference resolved")
                    .await;
            }
        };

        // Double-refund guard: a previous compensation attempt may have
        // issued the refund before its audit write was lost.
        match self.gateway.find_refund_for(&reference).await {
            Ok(Some(existing)) => {
                tracing::warn!(
                    account_id = %failed.account_id,
                    refund_ref = %existing,
                    "Refund already exists for this charge, not refunding again"
                );
                self.record_refund_row(&failed, &reference, &existing).await;
                return BillingError::ActivationRefunded(failed.cause);
            }
            Ok(None) => {}
            Err(e) => {
                return self
                    .manual_intervention(&failed, &format!("refund lookup failed: {}", e))
                    .await;
            }
        }

        let spec = RefundSpec {
            payment_intent_ref: failed
                .txn_ref
                .clone()
                .filter(|r| self.gateway.is_transaction_ref(r)),
            charge_ref: failed.charge_ref.clone().or_else(|| {
                Some(reference.clone()).filter(|r| self.gateway.is_charge_ref(r))
            }),
            reason: format!("activation rollback: {}", failed.cause),
            metadata: std::collections::HashMap::from([(
                "account_id".to_string(),
                failed.account_id.to_string(),
            )]),
        };

        match self.gateway.create_refund(&spec).await {
            Ok(refund_ref) => {
                self.record_refund_row(&failed, &reference, &refund_ref).await;
                self.sink
                    .notify(BillingNotice::RefundIssued {
                        account_id: failed.account_id,
                        refund_ref,
                        amount_cents: failed.amount_cents,
                    })
                    .await;
                BillingError::ActivationRefunded(failed.cause)
            }
            Err(e) => {
                self.manual_intervention(&failed, &format!("refund creation failed: {}", e))
                    .await
            }
        }
    }

    /// Resolve something Stripe will accept a refund against. Prefers the
    /// known payment reference, then the charge, then a single recent charge
    /// matching the exact amount inside the match window.
    async fn resolve_reference(&self, failed: &FailedCommit) -> Option<String> {
        if let Some(txn_ref) = &failed.txn_ref {
            return Some(txn_ref.clone());
        }
        if let Some(charge_ref) = &failed.charge_ref {
            return Some(charge_ref.clone());
        }

        let customer_ref = failed.customer_ref.as_deref()?;
        let charges = match self.gateway.recent_charges(customer_ref, 10).await {
            Ok(charges) => charges,
            Err(e) => {
                tracing::error!(
                    account_id = %failed.account_id,
                    error = %e,
                    "Failed to list charges during reference resolution"
                );
                return None;
            }
        };

        let now_unix = OffsetDateTime::now_utc().unix_timestamp();
        let mut matches = charges.into_iter().filter(|c| {
            !c.refunded
                && c.amount_cents == failed.amount_cents
                && now_unix - c.created_unix < CHARGE_MATCH_WINDOW_SECS
        });
        let candidate = matches.next()?;
        // Two matching charges are ambiguous; refunding the wrong one is
        // worse than escalating.
        if matches.next().is_some() {
            tracing::error!(
                account_id = %failed.account_id,
                "Multiple charges match by amount, refusing to guess"
            );
            return None;
        }
        candidate
            .payment_intent_ref
            .or(Some(candidate.charge_ref))
    }

    async fn manual_intervention(&self, failed: &FailedCommit, detail: &str) -> BillingError {
        let row = NewPayment {
            account_id: failed.account_id,
            subscription_id: None,
            amount_cents: failed.amount_cents,
            status: PaymentStatus::RefundRequired,
            gateway_txn_ref: failed.txn_ref.clone(),
            gateway_session_ref: None,
            refund_ref: None,
            failure_reason: Some(format!("{}; {}", failed.cause, detail)),
            plan_name: failed.plan_name.clone(),
            payer_name: failed.payer_name.clone(),
        };
        self.swallow_audit_failure(self.store.record_payment(row).await, failed);

        self.sink
            .notify(BillingNotice::RefundRequired {
                account_id: failed.account_id,
                txn_ref: failed.txn_ref.clone().unwrap_or_default(),
                amount_cents: failed.amount_cents,
                detail: detail.to_string(),
            })
            .await;

        BillingError::CompensationRequired(format!(
            "payment for account {} needs a manual refund: {}",
            failed.account_id, detail
        ))
    }

    async fn record_refund_row(&self, failed: &FailedCommit, reference: &str, refund_ref: &str) {
        let row = NewPayment {
            account_id: failed.account_id,
            subscription_id: None,
            amount_cents: failed.amount_cents,
            status: PaymentStatus::PendingRefund,
            gateway_txn_ref: Some(reference.to_string()),
            gateway_session_ref: None,
            refund_ref: Some(refund_ref.to_string()),
            failure_reason: Some(failed.cause.clone()),
            plan_name: failed.plan_name.clone(),
            payer_name: failed.payer_name.clone(),
        };
        self.swallow_audit_failure(self.store.record_payment(row).await, failed);
    }

    fn swallow_audit_failure<T>(&self, result: BillingResult<T>, failed: &FailedCommit) {
        if let Err(e) = result {
            tracing::error!(
                account_id = %failed.account_id,
                error = %e,
                "Failed to write compensation audit row"
            );
        }
    }
}
