//! Notification sink
//!
//! Billing lifecycle events fan out through this port. Delivery is
//! best-effort and must never affect the state transition that produced the
//! notice; callers log sink failures and move on.

use async_trait::async_trait;
use uuid::Uuid;

/// A billing lifecycle event worth telling someone about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingNotice {
    ActivationCompleted {
        account_id: Uuid,
        plan_name: String,
        amount_cents: i64,
    },
    RenewalFailed {
        account_id: Uuid,
        plan_name: String,
        failure_reason: String,
    },
    SubscriptionCanceled {
        account_id: Uuid,
        plan_name: String,
    },
    RefundIssued {
        account_id: Uuid,
        refund_ref: String,
        amount_cents: i64,
    },
    /// Money moved but no refund could be created; a human must act.
    RefundRequired {
        account_id: Uuid,
        txn_ref: String,
        amount_cents: i64,
        detail: String,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notice: BillingNotice);
}

/// Default sink: structured log lines. Operator-facing notices go out at
/// error level so they page.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, notice: BillingNotice) {
        match &notice {
            BillingNotice::ActivationCompleted {
                account_id,
                plan_name,
                amount_cents,
            } => {
                tracing::info!(
                    account_id = %account_id,
                    plan = %plan_name,
                    amount_cents = amount_cents,
                    "Subscription activated"
                );
            }
            BillingNotice::RenewalFailed {
                account_id,
                plan_name,
                failure_reason,
            } => {
                tracing::warn!(
                    account_id = %account_id,
                    plan = %plan_name,
                    reason = %failure_reason,
                    "Subscription renewal failed"
                );
            }
            BillingNotice::SubscriptionCanceled {
                account_id,
                plan_name,
            } => {
                tracing::info!(
                    account_id = %account_id,
                    plan = %plan_name,
                    "Subscription canceled"
                );
            }
            BillingNotice::RefundIssued {
                account_id,
                refund_ref,
                amount_cents,
            } => {
                tracing::warn!(
                    account_id = %account_id,
                    refund_ref = %refund_ref,
                    amount_cents = amount_cents,
                    "Compensating refund issued"
                );
            }
            BillingNotice::RefundRequired {
                account_id,
                txn_ref,
                amount_cents,
                detail,
            } => {
                tracing::error!(
                    account_id = %account_id,
                    txn_ref = %txn_ref,
                    amount_cents = amount_cents,
                    detail = %detail,
                    "MANUAL REFUND REQUIRED: payment succeeded but could not be compensated"
                );
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Test sink that records every notice in order.
    #[derive(Default)]
    pub struct RecordingSink {
        notices: Mutex<Vec<BillingNotice>>,
    }

    impl RecordingSink {
        pub fn notices(&self) -> Vec<BillingNotice> {
            self.notices.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, notice: BillingNotice) {
            self.notices.lock().unwrap().push(notice);
        }
    }
}
