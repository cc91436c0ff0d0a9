//! Price and entitlement sync
//!
//! Keeps local plan pricing aligned with the gateway's canonical price
//! records, and migrates live recurring subscriptions when a plan moves to
//! a new price. Per-subscription migration failures are collected and
//! skipped, never fatal to the rest of the run; snapshotted prices on
//! already-active terms are never rewritten.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentGateway, PriceView};
use crate::store::EntitlementStore;
use crate::types::{BillingCycle, Plan};

#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub prices_updated: u32,
    pub subscriptions_migrated: u32,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.prices_updated += other.prices_updated;
        self.subscriptions_migrated += other.subscriptions_migrated;
        self.errors.extend(other.errors);
    }
}

pub struct PriceSyncService {
    store: Arc<dyn EntitlementStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PriceSyncService {
    pub fn new(store: Arc<dyn EntitlementStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// React to a gateway price change: update the owning plan and migrate
    /// recurring subscriptions off the superseded price.
    pub async fn sync_price(&self, price_ref: &str) -> BillingResult<SyncReport> {
        let price = self.gateway.fetch_price(price_ref).await?;
        let plans = self
            .store
            .plans_by_product_ref(&price.product_ref)
            .await?;

        if plans.is_empty() {
            tracing::debug!(
                price_ref = %price_ref,
                product_ref = %price.product_ref,
                "Price change for a product with no local plan, ignoring"
            );
            return Ok(SyncReport::default());
        }

        let mut report = SyncReport::default();
        for plan in plans {
            match self.apply_price_to_plan(&plan, &price).await {
                Ok(sub_report) => report.merge(sub_report),
                Err(e) => {
                    tracing::error!(
                        plan = %plan.name,
                        price_ref = %price_ref,
                        error = %e,
                        "Failed to apply price change to plan"
                    );
                    report.errors.push(format!("plan {}: {}", plan.name, e));
                }
            }
        }
        Ok(report)
    }

    /// React to a gateway product change by re-syncing every configured
    /// price on the plans that reference it.
    pub async fn sync_product(&self, product_ref: &str) -> BillingResult<SyncReport> {
        let plans = self.store.plans_by_product_ref(product_ref).await?;
        let mut report = SyncReport::default();
        for plan in &plans {
            report.merge(self.refresh_plan(plan).await);
        }
        Ok(report)
    }

    /// Full reconciliation pass over every active plan. Admin-triggered.
    pub async fn sync_all(&self) -> BillingResult<SyncReport> {
        let plans = self.store.list_active_plans().await?;
        let mut report = SyncReport::default();
        for plan in &plans {
            report.merge(self.refresh_plan(plan).await);
        }

        tracing::info!(
            prices_updated = report.prices_updated,
            subscriptions_migrated = report.subscriptions_migrated,
            errors = report.errors.len(),
            "Completed full price sync"
        );
        Ok(report)
    }

    /// Re-fetch both configured prices for one plan; collects errors
    /// instead of propagating so one bad price cannot block the rest.
    async fn refresh_plan(&self, plan: &Plan) -> SyncReport {
        let mut report = SyncReport::default();
        for cycle in [BillingCycle::Monthly, BillingCycle::Yearly] {
            let Some(price_ref) = plan.gateway_price_ref(cycle) else {
                continue;
            };
            let price = match self.gateway.fetch_price(price_ref).await {
                Ok(price) => price,
                Err(e) => {
                    tracing::error!(
                        plan = %plan.name,
                        price_ref = %price_ref,
                        error = %e,
                        "Failed to fetch price during sync"
                    );
                    report
                        .errors
                        .push(format!("plan {} {}: {}", plan.name, cycle, e));
                    continue;
                }
            };
            if price.amount_cents != plan.price_cents(cycle) {
                match self
                    .store
                    .update_plan_price(&plan.name, cycle, price.amount_cents, &price.price_ref)
                    .await
                {
                    Ok(()) => {
                        tracing::info!(
                            plan = %plan.name,
                            cycle = %cycle,
                            old_cents = plan.price_cents(cycle),
                            new_cents = price.amount_cents,
                            "Updated plan price from gateway"
                        );
                        report.prices_updated += 1;
                    }
                    Err(e) => report
                        .errors
                        .push(format!("plan {} {}: {}", plan.name, cycle, e)),
                }
            }
        }
        report
    }

    async fn apply_price_to_plan(
        &self,
        plan: &Plan,
        price: &PriceView,
    ) -> BillingResult<SyncReport> {
        let cycle = match price.recurring_interval.as_deref() {
            Some("month") => BillingCycle::Monthly,
            Some("year") => BillingCycle::Yearly,
            other => {
                return Err(BillingError::Gateway(format!(
                    "price {} has unsupported interval {:?}",
                    price.price_ref, other
                )));
            }
        };

        let old_price_ref = plan.gateway_price_ref(cycle).map(|s| s.to_string());
        let mut report = SyncReport::default();

        let changed = old_price_ref.as_deref() != Some(price.price_ref.as_str())
            || plan.price_cents(cycle) != price.amount_cents;
        if !changed {
            return Ok(report);
        }

        self.store
            .update_plan_price(&plan.name, cycle, price.amount_cents, &price.price_ref)
            .await?;
        report.prices_updated += 1;

        tracing::info!(
            plan = %plan.name,
            cycle = %cycle,
            price_ref = %price.price_ref,
            amount_cents = price.amount_cents,
            "Plan repriced from gateway"
        );

        // Migrate live recurring subscriptions off the superseded price so
        // their next renewal charges the new amount. Existing terms keep
        // their snapshotted price.
        if let Some(old_ref) = old_price_ref.filter(|r| r != &price.price_ref) {
            report.merge(self.migrate_subscriptions(&old_ref, &price.price_ref).await);
        }

        Ok(report)
    }

    async fn migrate_subscriptions(&self, old_ref: &str, new_ref: &str) -> SyncReport {
        let mut report = SyncReport::default();
        let subs = match self.store.subscriptions_by_price_ref(old_ref).await {
            Ok(subs) => subs,
            Err(e) => {
                report
                    .errors
                    .push(format!("listing subscriptions on {}: {}", old_ref, e));
                return report;
            }
        };

        for sub in subs {
            let Some(gateway_ref) = sub.gateway_subscription_ref.as_deref() else {
                continue;
            };
            let migrated = async {
                self.gateway
                    .update_subscription_price(gateway_ref, old_ref, new_ref)
                    .await?;
                self.store
                    .set_subscription_price_ref(sub.id, new_ref)
                    .await
            }
            .await;

            match migrated {
                Ok(()) => {
                    tracing::info!(
                        subscription_ref = %gateway_ref,
                        old_price = %old_ref,
                        new_price = %new_ref,
                        "Migrated subscription to new price"
                    );
                    report.subscriptions_migrated += 1;
                }
                Err(e) => {
                    tracing::error!(
                        subscription_ref = %gateway_ref,
                        error = %e,
                        "Failed to migrate subscription, skipping"
                    );
                    report
                        .errors
                        .push(format!("subscription {}: {}", gateway_ref, e));
                }
            }
        }
        report
    }
}
