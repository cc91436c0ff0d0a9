//! Checkout initiation
//!
//! Validates the purchase, ensures a gateway customer exists, and opens a
//! hosted checkout session. Nothing is granted here; entitlements change
//! only after payment verification.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CheckoutMetadata, CustomerSpec, PaymentGateway, PurchaseKind, SessionMode, SessionSpec,
};
use crate::store::EntitlementStore;
use crate::types::{AccountProfile, BillingCycle, NewPayment, PaymentStatus, QuotaSet};
use time::OffsetDateTime;

/// One-time quota top-up offer.
#[derive(Debug, Clone, Serialize)]
pub struct AddonOffer {
    pub id: &'static str,
    pub name: &'static str,
    pub price_cents: i64,
    pub grants: QuotaSet,
}

/// Purchasable add-on catalog. Static for now; prices here are the amounts
/// verified against the gateway charge at activation time.
pub const ADDON_OFFERS: &[AddonOffer] = &[
    AddonOffer {
        id: "rfp_pack_10",
        name: "10 RFP credits",
        price_cents: 1500,
        grants: QuotaSet {
            editor_seats: 0,
            viewer_seats: 0,
            rfp_credits: 10,
            grant_credits: 0,
        },
    },
    AddonOffer {
        id: "grant_pack_5",
        name: "5 grant application credits",
        price_cents: 2500,
        grants: QuotaSet {
            editor_seats: 0,
            viewer_seats: 0,
            rfp_credits: 0,
            grant_credits: 5,
        },
    },
    AddonOffer {
        id: "editor_seat",
        name: "Additional editor seat",
        price_cents: 900,
        grants: QuotaSet {
            editor_seats: 1,
            viewer_seats: 0,
            rfp_credits: 0,
            grant_credits: 0,
        },
    },
    AddonOffer {
        id: "viewer_pack_5",
        name: "5 viewer seats",
        price_cents: 500,
        grants: QuotaSet {
            editor_seats: 0,
            viewer_seats: 5,
            rfp_credits: 0,
            grant_credits: 0,
        },
    },
];

pub fn addon_by_id(id: &str) -> Option<&'static AddonOffer> {
    ADDON_OFFERS.iter().find(|offer| offer.id == id)
}

/// Redirect response returned to the frontend.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub redirect_url: String,
}

pub struct CheckoutService {
    store: Arc<dyn EntitlementStore>,
    gateway: Arc<dyn PaymentGateway>,
    success_url: String,
    cancel_url: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn PaymentGateway>,
        success_url: String,
        cancel_url: String,
    ) -> Self {
        Self {
            store,
            gateway,
            success_url,
            cancel_url,
        }
    }

    /// Open a recurring checkout session for a public plan.
    pub async fn start_plan_checkout(
        &self,
        account_id: Uuid,
        plan_name: &str,
        cycle: BillingCycle,
    ) -> BillingResult<CheckoutResponse> {
        let profile = self.authorize(account_id).await?;

        let plan = self
            .store
            .plan_by_name(plan_name)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(plan_name.to_string()))?;
        if !plan.is_active {
            return Err(BillingError::Validation(format!(
                "Plan '{}' is not available for purchase",
                plan_name
            )));
        }
        if plan.is_custom {
            return Err(BillingError::Validation(format!(
                "Plan '{}' requires an enterprise checkout",
                plan_name
            )));
        }
        let price_ref = plan
            .gateway_price_ref(cycle)
            .ok_or_else(|| BillingError::MissingPriceConfig(plan_name.to_string()))?
            .to_string();

        let customer_ref = self.ensure_customer(&profile).await?;

        let spec = SessionSpec {
            customer_ref,
            mode: SessionMode::Subscription,
            price_ref: Some(price_ref.clone()),
            amount_cents: None,
            description: format!("{} plan ({})", plan.name, cycle),
            metadata: CheckoutMetadata {
                account_id,
                plan_name: plan.name.clone(),
                billing_cycle: cycle,
                expected_price_ref: Some(price_ref),
                kind: PurchaseKind::Plan,
                addon_id: None,
            },
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
        };

        let handle = self.gateway.create_checkout_session(&spec).await?;

        tracing::info!(
            account_id = %account_id,
            plan = %plan_name,
            cycle = %cycle,
            session_id = %handle.session_id,
            "Started plan checkout"
        );

        Ok(CheckoutResponse {
            session_id: handle.session_id,
            redirect_url: handle.redirect_url,
        })
    }

    /// Open a one-time checkout session for an enterprise custom plan.
    ///
    /// Custom plans have no recurring gateway subscription; the term is
    /// granted locally after the one-time charge verifies.
    pub async fn start_custom_plan_checkout(
        &self,
        account_id: Uuid,
        plan_name: &str,
        cycle: BillingCycle,
    ) -> BillingResult<CheckoutResponse> {
        let profile = self.authorize(account_id).await?;

        let plan = self
            .store
            .plan_by_name(plan_name)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(plan_name.to_string()))?;
        if !plan.is_custom || !plan.is_active {
            return Err(BillingError::Validation(format!(
                "Plan '{}' is not an available custom plan",
                plan_name
            )));
        }
        let amount = plan.price_cents(cycle);
        if amount <= 0 {
            return Err(BillingError::MissingPriceConfig(plan_name.to_string()));
        }

        let customer_ref = self.ensure_customer(&profile).await?;

        let spec = SessionSpec {
            customer_ref,
            mode: SessionMode::OneTime,
            price_ref: None,
            amount_cents: Some(amount),
            description: format!("{} plan, one {} term", plan.name, cycle),
            metadata: CheckoutMetadata {
                account_id,
                plan_name: plan.name.clone(),
                billing_cycle: cycle,
                expected_price_ref: None,
                kind: PurchaseKind::CustomPlan,
                addon_id: None,
            },
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
        };

        let handle = self.gateway.create_checkout_session(&spec).await?;
        self.record_pending(&profile, amount, plan_name, &handle.session_id)
            .await;

        tracing::info!(
            account_id = %account_id,
            plan = %plan_name,
            session_id = %handle.session_id,
            "Started custom plan checkout"
        );

        Ok(CheckoutResponse {
            session_id: handle.session_id,
            redirect_url: handle.redirect_url,
        })
    }

    /// Open a one-time checkout session for a quota top-up. Requires a live
    /// subscription; add-ons extend a term, they never create one.
    pub async fn start_addon_checkout(
        &self,
        account_id: Uuid,
        addon_id: &str,
    ) -> BillingResult<CheckoutResponse> {
        let profile = self.authorize(account_id).await?;

        let offer = addon_by_id(addon_id)
            .ok_or_else(|| BillingError::Validation(format!("Unknown add-on '{}'", addon_id)))?;

        let now = OffsetDateTime::now_utc();
        let live = self
            .store
            .subscription_by_owner(account_id)
            .await?
            .is_some_and(|s| s.is_live(now));
        if !live {
            return Err(BillingError::Validation(
                "Add-ons require an active subscription".to_string(),
            ));
        }

        let customer_ref = self.ensure_customer(&profile).await?;

        let spec = SessionSpec {
            customer_ref,
            mode: SessionMode::OneTime,
            price_ref: None,
            amount_cents: Some(offer.price_cents),
            description: offer.name.to_string(),
            metadata: CheckoutMetadata {
                account_id,
                plan_name: offer.id.to_string(),
                billing_cycle: BillingCycle::Monthly,
                expected_price_ref: None,
                kind: PurchaseKind::Addon,
                addon_id: Some(offer.id.to_string()),
            },
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
        };

        let handle = self.gateway.create_checkout_session(&spec).await?;
        self.record_pending(&profile, offer.price_cents, offer.id, &handle.session_id)
            .await;

        tracing::info!(
            account_id = %account_id,
            addon = %addon_id,
            session_id = %handle.session_id,
            "Started add-on checkout"
        );

        Ok(CheckoutResponse {
            session_id: handle.session_id,
            redirect_url: handle.redirect_url,
        })
    }

    async fn authorize(&self, account_id: Uuid) -> BillingResult<AccountProfile> {
        let profile = self
            .store
            .account_profile(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;
        if !profile.role.can_manage_billing() {
            return Err(BillingError::Validation(
                "Only owners and admins can manage billing".to_string(),
            ));
        }
        Ok(profile)
    }

    /// Reuse the stored customer reference when it is still live at the
    /// gateway; otherwise create a fresh customer and persist the new ref.
    async fn ensure_customer(&self, profile: &AccountProfile) -> BillingResult<String> {
        if let Some(existing) = &profile.gateway_customer_ref {
            if self.gateway.customer_exists(existing).await? {
                return Ok(existing.clone());
            }
            tracing::warn!(
                account_id = %profile.id,
                customer_ref = %existing,
                "Stored gateway customer no longer exists, recreating"
            );
        }

        let customer_ref = self
            .gateway
            .create_customer(&CustomerSpec {
                account_id: profile.id,
                email: profile.email.clone(),
                display_name: profile.display_name.clone(),
            })
            .await?;
        self.store
            .set_customer_ref(profile.id, &customer_ref)
            .await?;
        Ok(customer_ref)
    }

    /// Pending audit row for a one-time session. Best effort: a failure here
    /// never blocks the checkout that was already created.
    async fn record_pending(
        &self,
        profile: &AccountProfile,
        amount_cents: i64,
        label: &str,
        session_id: &str,
    ) {
        let result = self
            .store
            .record_payment(NewPayment {
                account_id: profile.id,
                subscription_id: None,
                amount_cents,
                status: PaymentStatus::Pending,
                gateway_txn_ref: None,
                gateway_session_ref: Some(session_id.to_string()),
                refund_ref: None,
                failure_reason: None,
                plan_name: label.to_string(),
                payer_name: profile.display_name.clone(),
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(
                account_id = %profile.id,
                session_id = %session_id,
                error = %e,
                "Failed to record pending payment row"
            );
        }
    }
}
