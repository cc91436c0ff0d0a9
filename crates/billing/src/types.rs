//! Billing domain types
//!
//! Three entities owned by the engine (Plan is read-mostly here, written by
//! admin tooling and the price sync): Plan, Subscription, Payment, plus the
//! billing fields mirrored on the owning account.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use bidcraft_shared::{AccountRole, BillingStatus};

/// Billing cycle for a recurring plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingCycle::Monthly),
            "yearly" | "annual" => Some(BillingCycle::Yearly),
            _ => None,
        }
    }

    /// Length of one billing term.
    pub fn term(&self) -> Duration {
        match self {
            BillingCycle::Monthly => Duration::days(30),
            BillingCycle::Yearly => Duration::days(365),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Usage quotas granted by a plan: max counts per tracked resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSet {
    pub editor_seats: i64,
    pub viewer_seats: i64,
    pub rfp_credits: i64,
    pub grant_credits: i64,
}

impl QuotaSet {
    /// Saturating element-wise addition (add-on top-ups).
    pub fn plus(&self, other: &QuotaSet) -> QuotaSet {
        QuotaSet {
            editor_seats: self.editor_seats.saturating_add(other.editor_seats),
            viewer_seats: self.viewer_seats.saturating_add(other.viewer_seats),
            rfp_credits: self.rfp_credits.saturating_add(other.rfp_credits),
            grant_credits: self.grant_credits.saturating_add(other.grant_credits),
        }
    }
}

/// Carry unused quota balance forward into a new term.
///
/// `plan_quota + (old_max - old_used)`, floored at the plan default when the
/// prior subscription tracked no usage (or the balance would be negative).
pub fn carry_forward(plan_quota: i64, old_max: i64, old_used: i64) -> i64 {
    plan_quota.saturating_add((old_max - old_used).max(0))
}

/// A priced product tier.
///
/// `name` is the stable identity key used throughout the engine; the row id
/// is never used for cross-entity references. Price fields are written only
/// by the price sync or an admin override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    pub gateway_product_ref: Option<String>,
    pub gateway_price_monthly: Option<String>,
    pub gateway_price_yearly: Option<String>,
    pub quotas: QuotaSet,
    pub is_active: bool,
    /// Enterprise custom plans: not publicly listed, sold via one-time
    /// sessions, activated without a recurring gateway subscription.
    pub is_custom: bool,
}

impl Plan {
    /// Expected charge for one term of this plan, in minor units.
    pub fn price_cents(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.monthly_price_cents,
            BillingCycle::Yearly => self.yearly_price_cents,
        }
    }

    /// Gateway price reference for the requested cycle.
    pub fn gateway_price_ref(&self, cycle: BillingCycle) -> Option<&str> {
        match cycle {
            BillingCycle::Monthly => self.gateway_price_monthly.as_deref(),
            BillingCycle::Yearly => self.gateway_price_yearly.as_deref(),
        }
    }
}

/// Per-resource max/used counter pair tracked on a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub max: i64,
    pub used: i64,
}

/// Quota counters for every tracked resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub editor_seats: QuotaCounter,
    pub viewer_seats: QuotaCounter,
    pub rfp_credits: QuotaCounter,
    pub grant_credits: QuotaCounter,
}

impl QuotaUsage {
    /// Fresh counters for a new term: plan quotas carried forward against the
    /// previous term's unused balance, usage reset to zero.
    pub fn for_new_term(plan: &QuotaSet, previous: Option<&QuotaUsage>) -> QuotaUsage {
        let prev = previous.copied().unwrap_or_default();
        QuotaUsage {
            editor_seats: QuotaCounter {
                max: carry_forward(
                    plan.editor_seats,
                    prev.editor_seats.max,
                    prev.editor_seats.used,
                ),
                used: 0,
            },
            viewer_seats: QuotaCounter {
                max: carry_forward(
                    plan.viewer_seats,
                    prev.viewer_seats.max,
                    prev.viewer_seats.used,
                ),
                used: 0,
            },
            rfp_credits: QuotaCounter {
                max: carry_forward(
                    plan.rfp_credits,
                    prev.rfp_credits.max,
                    prev.rfp_credits.used,
                ),
                used: 0,
            },
            grant_credits: QuotaCounter {
                max: carry_forward(
                    plan.grant_credits,
                    prev.grant_credits.max,
                    prev.grant_credits.used,
                ),
                used: 0,
            },
        }
    }
}

/// One subscription per paying account, upserted by owner identity.
///
/// Plan name and price are snapshotted at activation time so a later price
/// change never retroactively alters an active term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: Uuid,
    pub plan_name: String,
    pub price_cents: i64,
    pub billing_cycle: BillingCycle,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    pub renewal_date: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub canceled_at: Option<OffsetDateTime>,
    /// Null for manually-provisioned or one-time enterprise plans.
    pub gateway_subscription_ref: Option<String>,
    pub gateway_price_ref: Option<String>,
    pub gateway_product_ref: Option<String>,
    pub quotas: QuotaUsage,
}

impl Subscription {
    /// Whether this subscription currently grants entitlements.
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        self.canceled_at.is_none() && self.end_date > now
    }
}

/// Payment audit row status. Closed set; `Success` rows are immutable except
/// for appending a refund reference (status then `PendingRefund`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Pre-activation attempt awaiting gateway completion (enterprise
    /// one-time sessions).
    Pending,
    Success,
    Failed,
    /// Money moved, local commit failed, refund created and awaiting
    /// settlement.
    PendingRefund,
    /// Money moved, no refundable reference resolved. Terminal; operator
    /// intervention required.
    RefundRequired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::PendingRefund => "pending_refund",
            PaymentStatus::RefundRequired => "refund_required",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "success" => Some(PaymentStatus::Success),
            "failed" => Some(PaymentStatus::Failed),
            "pending_refund" => Some(PaymentStatus::PendingRefund),
            "refund_required" => Some(PaymentStatus::RefundRequired),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable-once-successful audit row. One row per attempt; nothing is
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    pub gateway_txn_ref: Option<String>,
    pub gateway_session_ref: Option<String>,
    pub refund_ref: Option<String>,
    pub failure_reason: Option<String>,
    /// Denormalized for reporting.
    pub plan_name: String,
    pub payer_name: String,
    pub paid_at: OffsetDateTime,
}

/// New payment row to append.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    pub gateway_txn_ref: Option<String>,
    pub gateway_session_ref: Option<String>,
    pub refund_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub plan_name: String,
    pub payer_name: String,
}

/// Billing-relevant view of the owning account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: AccountRole,
    pub billing_status: BillingStatus,
    pub gateway_customer_ref: Option<String>,
}
