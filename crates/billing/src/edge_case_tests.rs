// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Reconciliation Engine
//!
//! Exercises the full engine over the in-memory store and a scripted mock
//! gateway: activation and replay, amount verification, quota carry-forward,
//! compensation, webhook dispatch, and price sync.

mod support {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use crate::activation::ActivationService;
    use crate::checkout::CheckoutService;
    use crate::error::{BillingError, BillingResult};
    use crate::gateway::{
        ChargeView, CheckoutMetadata, CustomerSpec, EventEnvelope, GatewayPaymentStatus,
        GatewaySubscriptionView, PaymentGateway, PaymentView, PriceView, PurchaseKind,
        RefundSpec, SessionHandle, SessionMode, SessionSpec, SessionView,
    };
    use crate::idempotency::IdempotencyLedger;
    use crate::memory::MemoryStore;
    use crate::notify::testing::RecordingSink;
    use crate::store::EntitlementStore;
    use crate::sync::PriceSyncService;
    use crate::types::{AccountProfile, BillingCycle, Plan, QuotaSet};
    use crate::webhooks::WebhookDispatcher;
    use bidcraft_shared::{AccountRole, BillingStatus};

    #[derive(Default)]
    struct MockWorld {
        customers: HashSet<String>,
        sessions: HashMap<String, SessionView>,
        payments: HashMap<String, PaymentView>,
        subscriptions: HashMap<String, GatewaySubscriptionView>,
        prices: HashMap<String, PriceView>,
        charges: HashMap<String, Vec<ChargeView>>,
        /// reference -> refund ref, covering pre-existing and created refunds
        refunds: HashMap<String, String>,
        created_refunds: Vec<RefundSpec>,
        price_moves: Vec<(String, String, String)>,
        timeout_sessions: HashSet<String>,
        fail_refunds: bool,
        fail_price_update_for: HashSet<String>,
    }

    /// Scripted gateway. Signature "invalid" fails verification; any other
    /// signature is accepted and the payload parsed as the event.
    #[derive(Default)]
    pub struct MockGateway {
        world: Mutex<MockWorld>,
        counter: AtomicU64,
    }

    impl MockGateway {
        fn next(&self, prefix: &str) -> String {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            format!("{}_mock_{}", prefix, n)
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockWorld> {
            self.world.lock().unwrap()
        }

        pub fn put_customer(&self, customer_ref: &str) {
            self.lock().customers.insert(customer_ref.to_string());
        }

        pub fn put_session(&self, session: SessionView) {
            self.lock()
                .sessions
                .insert(session.session_id.clone(), session);
        }

        pub fn put_payment(&self, payment: PaymentView) {
            self.lock()
                .payments
                .insert(payment.txn_ref.clone(), payment);
        }

        pub fn put_subscription(&self, sub: GatewaySubscriptionView) {
            self.lock()
                .subscriptions
                .insert(sub.subscription_ref.clone(), sub);
        }

        pub fn put_price(&self, price: PriceView) {
            self.lock().prices.insert(price.price_ref.clone(), price);
        }

        pub fn put_existing_refund(&self, reference: &str, refund_ref: &str) {
            self.lock()
                .refunds
                .insert(reference.to_string(), refund_ref.to_string());
        }

        pub fn time_out_session(&self, session_id: &str) {
            self.lock().timeout_sessions.insert(session_id.to_string());
        }

        pub fn fail_refunds(&self) {
            self.lock().fail_refunds = true;
        }

        pub fn fail_price_update_for(&self, sub_ref: &str) {
            self.lock()
                .fail_price_update_for
                .insert(sub_ref.to_string());
        }

        pub fn created_refund_count(&self) -> usize {
            self.lock().created_refunds.len()
        }

        pub fn price_moves(&self) -> Vec<(String, String, String)> {
            self.lock().price_moves.clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_customer(&self, _spec: &CustomerSpec) -> BillingResult<String> {
            let customer_ref = self.next("cus");
            self.lock().customers.insert(customer_ref.clone());
            Ok(customer_ref)
        }

        async fn customer_exists(&self, customer_ref: &str) -> BillingResult<bool> {
            Ok(self.lock().customers.contains(customer_ref))
        }

        async fn create_checkout_session(
            &self,
            spec: &SessionSpec,
        ) -> BillingResult<SessionHandle> {
            let session_id = self.next("cs");
            let session = SessionView {
                session_id: session_id.clone(),
                mode: spec.mode,
                paid: false,
                payment_ref: None,
                subscription_ref: None,
                customer_ref: Some(spec.customer_ref.clone()),
                amount_total_cents: spec.amount_cents,
                metadata: spec.metadata.to_map(),
            };
            self.lock().sessions.insert(session_id.clone(), session);
            Ok(SessionHandle {
                session_id,
                redirect_url: "https://gateway.test/checkout".to_string(),
            })
        }

        async fn fetch_payment(&self, txn_ref: &str) -> BillingResult<PaymentView> {
            self.lock()
                .payments
                .get(txn_ref)
                .cloned()
                .ok_or_else(|| BillingError::Gateway(format!("no payment {}", txn_ref)))
        }

        async fn fetch_checkout_session(&self, session_id: &str) -> BillingResult<SessionView> {
            let world = self.lock();
            if world.timeout_sessions.contains(session_id) {
                return Err(BillingError::GatewayTimeout);
            }
            world
                .sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| BillingError::Gateway(format!("no session {}", session_id)))
        }

        async fn fetch_subscription(
            &self,
            sub_ref: &str,
        ) -> BillingResult<GatewaySubscriptionView> {
            self.lock()
                .subscriptions
                .get(sub_ref)
                .cloned()
                .ok_or_else(|| BillingError::Gateway(format!("no subscription {}", sub_ref)))
        }

        async fn fetch_price(&self, price_ref: &str) -> BillingResult<PriceView> {
            self.lock()
                .prices
                .get(price_ref)
                .cloned()
                .ok_or_else(|| BillingError::Gateway(format!("no price {}", price_ref)))
        }

        async fn find_refund_for(&self, reference: &str) -> BillingResult<Option<String>> {
            Ok(self.lock().refunds.get(reference).cloned())
        }

        async fn create_refund(&self, spec: &RefundSpec) -> BillingResult<String> {
            let refund_ref = self.next("re");
            let mut world = self.lock();
            if world.fail_refunds {
                return Err(BillingError::RefundFailed("mock refund failure".into()));
            }
            let reference = spec
                .payment_intent_ref
                .clone()
                .or_else(|| spec.charge_ref.clone())
                .ok_or_else(|| BillingError::RefundFailed("no reference".into()))?;
            world.refunds.insert(reference, refund_ref.clone());
            world.created_refunds.push(spec.clone());
            Ok(refund_ref)
        }

        async fn recent_charges(
            &self,
            customer_ref: &str,
            _limit: u8,
        ) -> BillingResult<Vec<ChargeView>> {
            Ok(self
                .lock()
                .charges
                .get(customer_ref)
                .cloned()
                .unwrap_or_default())
        }

        async fn update_subscription_price(
            &self,
            sub_ref: &str,
            old_price_ref: &str,
            new_price_ref: &str,
        ) -> BillingResult<()> {
            let mut world = self.lock();
            if world.fail_price_update_for.contains(sub_ref) {
                return Err(BillingError::Gateway("mock price update failure".into()));
            }
            world.price_moves.push((
                sub_ref.to_string(),
                old_price_ref.to_string(),
                new_price_ref.to_string(),
            ));
            if let Some(sub) = world.subscriptions.get_mut(sub_ref) {
                sub.price_ref = Some(new_price_ref.to_string());
            }
            Ok(())
        }

        // Mock references follow the same scheme the fixtures use.
        fn is_transaction_ref(&self, reference: &str) -> bool {
            reference.starts_with("pi_")
        }

        fn is_charge_ref(&self, reference: &str) -> bool {
            reference.starts_with("ch_")
        }

        fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<EventEnvelope> {
            if signature == "invalid" {
                return Err(BillingError::WebhookSignatureInvalid);
            }
            let raw: serde_json::Value = serde_json::from_str(payload)
                .map_err(|_| BillingError::WebhookSignatureInvalid)?;
            Ok(EventEnvelope {
                event_id: raw["id"].as_str().unwrap_or_default().to_string(),
                event_type: raw["type"].as_str().unwrap_or_default().to_string(),
                created_unix: raw["created"]
                    .as_i64()
                    .unwrap_or_else(|| OffsetDateTime::now_utc().unix_timestamp()),
                object: raw["data"]["object"].clone(),
            })
        }
    }

    pub struct TestEngine {
        pub store: Arc<MemoryStore>,
        pub gateway: Arc<MockGateway>,
        pub sink: Arc<RecordingSink>,
        pub activation: Arc<ActivationService>,
        pub checkout: CheckoutService,
        pub sync: Arc<PriceSyncService>,
        pub dispatcher: WebhookDispatcher,
    }

    pub fn engine() -> TestEngine {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::default());
        let sink = Arc::new(RecordingSink::default());

        let store_dyn: Arc<dyn EntitlementStore> = store.clone();
        let gateway_dyn: Arc<dyn PaymentGateway> = gateway.clone();

        let activation = Arc::new(ActivationService::new(
            store_dyn.clone(),
            gateway_dyn.clone(),
            Arc::new(IdempotencyLedger::default()),
            sink.clone(),
        ));
        let sync = Arc::new(PriceSyncService::new(store_dyn.clone(), gateway_dyn.clone()));
        let dispatcher = WebhookDispatcher::new(
            gateway_dyn.clone(),
            store_dyn.clone(),
            activation.clone(),
            sync.clone(),
        );
        let checkout = CheckoutService::new(
            store_dyn,
            gateway_dyn,
            "https://app.test/billing/success".to_string(),
            "https://app.test/billing/cancel".to_string(),
        );

        TestEngine {
            store,
            gateway,
            sink,
            activation,
            checkout,
            sync,
            dispatcher,
        }
    }

    pub fn basic_plan() -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "Basic".into(),
            monthly_price_cents: 2900,
            yearly_price_cents: 29000,
            gateway_product_ref: Some("prod_basic".into()),
            gateway_price_monthly: Some("price_basic_m".into()),
            gateway_price_yearly: Some("price_basic_y".into()),
            quotas: QuotaSet {
                editor_seats: 5,
                viewer_seats: 10,
                rfp_credits: 5,
                grant_credits: 2,
            },
            is_active: true,
            is_custom: false,
        }
    }

    pub fn custom_plan() -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "Enterprise".into(),
            monthly_price_cents: 250_000,
            yearly_price_cents: 2_500_000,
            gateway_product_ref: Some("prod_enterprise".into()),
            gateway_price_monthly: None,
            gateway_price_yearly: None,
            quotas: QuotaSet {
                editor_seats: 50,
                viewer_seats: 200,
                rfp_credits: 100,
                grant_credits: 50,
            },
            is_active: true,
            is_custom: true,
        }
    }

    pub fn owner(role: AccountRole) -> AccountProfile {
        AccountProfile {
            id: Uuid::new_v4(),
            email: "owner@bidcraft.test".into(),
            display_name: "Avery Owner".into(),
            role,
            billing_status: BillingStatus::None,
            gateway_customer_ref: Some("cus_owner".into()),
        }
    }

    pub fn plan_metadata(account_id: Uuid) -> CheckoutMetadata {
        CheckoutMetadata {
            account_id,
            plan_name: "Basic".into(),
            billing_cycle: BillingCycle::Monthly,
            expected_price_ref: Some("price_basic_m".into()),
            kind: PurchaseKind::Plan,
            addon_id: None,
        }
    }

    /// A paid subscription-mode session plus its gateway subscription.
    pub fn seed_paid_checkout(gateway: &MockGateway, account_id: Uuid) -> (String, String) {
        let session_id = "cs_paid_1".to_string();
        let sub_ref = "sub_gw_1".to_string();
        let now = OffsetDateTime::now_utc();

        gateway.put_session(SessionView {
            session_id: session_id.clone(),
            mode: SessionMode::Subscription,
            paid: true,
            payment_ref: Some("pi_initial_1".into()),
            subscription_ref: Some(sub_ref.clone()),
            customer_ref: Some("cus_owner".into()),
            amount_total_cents: Some(2900),
            metadata: plan_metadata(account_id).to_map(),
        });
        gateway.put_subscription(GatewaySubscriptionView {
            subscription_ref: sub_ref.clone(),
            status: "active".into(),
            customer_ref: "cus_owner".into(),
            price_ref: Some("price_basic_m".into()),
            product_ref: Some("prod_basic".into()),
            period_start_unix: now.unix_timestamp(),
            period_end_unix: (now + Duration::days(30)).unix_timestamp(),
            metadata: plan_metadata(account_id).to_map(),
        });

        (session_id, sub_ref)
    }

    pub fn succeeded_payment(txn_ref: &str, amount_cents: i64) -> PaymentView {
        PaymentView {
            txn_ref: txn_ref.to_string(),
            status: GatewayPaymentStatus::Succeeded,
            amount_cents,
            currency: "usd".into(),
            charge_ref: Some("ch_mock".into()),
            customer_ref: Some("cus_owner".into()),
            metadata: HashMap::new(),
            created_unix: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

// =============================================================================
// Activation: verification, replay, carry-forward
// =============================================================================
mod activation_tests {
    use super::support::*;
    use crate::activation::ActivationOutcome;
    use crate::error::BillingError;
    use crate::gateway::{GatewaySubscriptionView, PurchaseKind, SessionMode, SessionView};
    use crate::store::{ActivationCommit, EntitlementStore};
    use crate::types::{
        BillingCycle, NewPayment, PaymentStatus, QuotaCounter, QuotaUsage,
    };
    use bidcraft_shared::{AccountRole, BillingStatus};
    use time::{Duration, OffsetDateTime};

    // =========================================================================
    // $29 Basic plan: verified session activates exactly once
    // =========================================================================
    #[tokio::test]
    async fn test_paid_checkout_activates_subscription() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, sub_ref) = seed_paid_checkout(&eng.gateway, account_id);

        let outcome = eng.activation.activate_session(&session_id).await.unwrap();
        let ActivationOutcome::Activated(sub) = outcome else {
            panic!("expected a fresh activation");
        };

        assert_eq!(sub.plan_name, "Basic");
        assert_eq!(sub.price_cents, 2900);
        assert_eq!(sub.gateway_subscription_ref.as_deref(), Some(sub_ref.as_str()));
        assert_eq!(sub.quotas.editor_seats.max, 5);
        assert_eq!(sub.quotas.rfp_credits.used, 0);
        assert!(sub.auto_renew);

        let status = eng
            .store
            .account_profile(account_id)
            .await
            .unwrap()
            .unwrap()
            .billing_status;
        assert_eq!(status, BillingStatus::Active, "owner flips to active");

        let payments = eng.store.payments_for(account_id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Success);
        assert_eq!(payments[0].gateway_txn_ref.as_deref(), Some("pi_initial_1"));
    }

    // =========================================================================
    // Duplicate confirm call is a no-op returning existing state
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_confirm_is_noop() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);

        let first = eng.activation.activate_session(&session_id).await.unwrap();
        let second = eng.activation.activate_session(&session_id).await.unwrap();

        assert!(matches!(second, ActivationOutcome::AlreadyProcessed(_)));
        assert_eq!(
            first.subscription().id,
            second.subscription().id,
            "replay returns the same subscription"
        );
        let payments = eng.store.payments_for(account_id).await;
        assert_eq!(payments.len(), 1, "no second payment row on replay");
    }

    // =========================================================================
    // Charged amount must equal the plan price exactly, in minor units
    // =========================================================================
    #[tokio::test]
    async fn test_amount_mismatch_rejected_and_recorded() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;

        eng.gateway.put_session(SessionView {
            session_id: "cs_cheap".into(),
            mode: SessionMode::Subscription,
            paid: true,
            payment_ref: Some("pi_cheap".into()),
            subscription_ref: None,
            customer_ref: Some("cus_owner".into()),
            amount_total_cents: Some(2800),
            metadata: plan_metadata(account_id).to_map(),
        });

        let err = eng
            .activation
            .activate_session("cs_cheap")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Verification(_)));

        let payments = eng.store.payments_for(account_id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Failed);
        assert!(
            eng.store
                .subscription_by_owner(account_id)
                .await
                .unwrap()
                .is_none(),
            "no entitlement from a mismatched charge"
        );
        assert_eq!(eng.gateway.created_refund_count(), 0, "never auto-refund unverified claims");
    }

    // =========================================================================
    // Unpaid session cannot activate
    // =========================================================================
    #[tokio::test]
    async fn test_unpaid_session_rejected() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;

        eng.gateway.put_session(SessionView {
            session_id: "cs_unpaid".into(),
            mode: SessionMode::Subscription,
            paid: false,
            payment_ref: Some("pi_unpaid".into()),
            subscription_ref: None,
            customer_ref: Some("cus_owner".into()),
            amount_total_cents: Some(2900),
            metadata: plan_metadata(account_id).to_map(),
        });

        let err = eng
            .activation
            .activate_session("cs_unpaid")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Verification(_)));
    }

    // =========================================================================
    // Gateway timeout aborts before any local write, and never refunds
    // =========================================================================
    #[tokio::test]
    async fn test_timeout_aborts_without_refund() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);
        eng.gateway.time_out_session(&session_id);

        let err = eng
            .activation
            .activate_session(&session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::GatewayTimeout));
        assert!(err.is_retryable(), "timeouts are safe to retry");

        assert!(eng.store.payments_for(account_id).await.is_empty());
        assert_eq!(
            eng.gateway.created_refund_count(),
            0,
            "unknown outcomes must never trigger a refund"
        );
    }

    // =========================================================================
    // Renewal carries unused quota forward: max=10 used=4, plan=5 -> 11
    // =========================================================================
    #[tokio::test]
    async fn test_renewal_carries_unused_quota_forward() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (_, sub_ref) = seed_paid_checkout(&eng.gateway, account_id);

        // Prior term with tracked usage on RFP credits
        let now = OffsetDateTime::now_utc();
        eng.store
            .commit_activation(ActivationCommit {
                account_id,
                plan_name: "Basic".into(),
                price_cents: 2900,
                billing_cycle: BillingCycle::Monthly,
                start_date: now - Duration::days(30),
                end_date: now,
                renewal_date: Some(now),
                auto_renew: true,
                gateway_subscription_ref: Some(sub_ref.clone()),
                gateway_price_ref: Some("price_basic_m".into()),
                gateway_product_ref: Some("prod_basic".into()),
                quotas: QuotaUsage {
                    rfp_credits: QuotaCounter { max: 10, used: 4 },
                    ..Default::default()
                },
                payment: NewPayment {
                    account_id,
                    subscription_id: None,
                    amount_cents: 2900,
                    status: PaymentStatus::Success,
                    gateway_txn_ref: Some("pi_prior_term".into()),
                    gateway_session_ref: None,
                    refund_ref: None,
                    failure_reason: None,
                    plan_name: "Basic".into(),
                    payer_name: "Avery Owner".into(),
                },
            })
            .await
            .unwrap();

        eng.gateway
            .put_payment(succeeded_payment("pi_renewal_1", 2900));

        let outcome = eng
            .activation
            .renew(&sub_ref, "pi_renewal_1")
            .await
            .unwrap();
        let sub = outcome.subscription();
        assert_eq!(sub.quotas.rfp_credits.max, 11, "5 plan + 6 unused carried");
        assert_eq!(sub.quotas.rfp_credits.used, 0, "usage resets on renewal");
        assert_eq!(sub.quotas.editor_seats.max, 5);
    }

    // =========================================================================
    // Duplicate renewal delivery keyed on the same payment is a no-op
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_renewal_is_noop() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, sub_ref) = seed_paid_checkout(&eng.gateway, account_id);
        eng.activation.activate_session(&session_id).await.unwrap();

        eng.gateway
            .put_payment(succeeded_payment("pi_renewal_1", 2900));

        let first = eng.activation.renew(&sub_ref, "pi_renewal_1").await.unwrap();
        let second = eng.activation.renew(&sub_ref, "pi_renewal_1").await.unwrap();

        assert!(matches!(first, ActivationOutcome::Activated(_)));
        assert!(matches!(second, ActivationOutcome::AlreadyProcessed(_)));

        let success_rows = eng
            .store
            .payments_for(account_id)
            .await
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Success)
            .count();
        assert_eq!(success_rows, 2, "initial activation plus one renewal");
    }

    // =========================================================================
    // Concurrent activations of one payment produce exactly one subscription
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_activation_single_subscription() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);

        let a = {
            let activation = eng.activation.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { activation.activate_session(&session_id).await })
        };
        let b = {
            let activation = eng.activation.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { activation.activate_session(&session_id).await })
        };

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();
        assert_eq!(first.subscription().id, second.subscription().id);

        let success_rows = eng
            .store
            .payments_for(account_id)
            .await
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Success)
            .count();
        assert_eq!(success_rows, 1, "one Success row despite the race");
    }

    // =========================================================================
    // Custom enterprise plan: one-time session grants a local fixed term
    // =========================================================================
    #[tokio::test]
    async fn test_custom_plan_one_time_activation() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(custom_plan()).await;
        eng.store.insert_account(profile).await;

        let meta = crate::gateway::CheckoutMetadata {
            account_id,
            plan_name: "Enterprise".into(),
            billing_cycle: BillingCycle::Yearly,
            expected_price_ref: None,
            kind: PurchaseKind::CustomPlan,
            addon_id: None,
        };
        eng.gateway.put_session(SessionView {
            session_id: "cs_custom".into(),
            mode: SessionMode::OneTime,
            paid: true,
            payment_ref: Some("pi_custom".into()),
            subscription_ref: None,
            customer_ref: Some("cus_owner".into()),
            amount_total_cents: Some(2_500_000),
            metadata: meta.to_map(),
        });

        let outcome = eng.activation.activate_session("cs_custom").await.unwrap();
        let sub = outcome.subscription();
        assert_eq!(sub.plan_name, "Enterprise");
        assert!(!sub.auto_renew, "one-time terms do not auto-renew");
        assert!(sub.gateway_subscription_ref.is_none());
        assert!(sub.renewal_date.is_none());
        let term = sub.end_date - sub.start_date;
        assert_eq!(term.whole_days(), 365);
    }

    // =========================================================================
    // First renewal delivery before local activation uses gateway metadata
    // =========================================================================
    #[tokio::test]
    async fn test_renewal_without_local_subscription_uses_gateway_metadata() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let now = OffsetDateTime::now_utc();
        eng.gateway.put_subscription(GatewaySubscriptionView {
            subscription_ref: "sub_orphan".into(),
            status: "active".into(),
            customer_ref: "cus_owner".into(),
            price_ref: Some("price_basic_m".into()),
            product_ref: Some("prod_basic".into()),
            period_start_unix: now.unix_timestamp(),
            period_end_unix: (now + Duration::days(30)).unix_timestamp(),
            metadata: plan_metadata(account_id).to_map(),
        });
        eng.gateway
            .put_payment(succeeded_payment("pi_orphan", 2900));

        let outcome = eng.activation.renew("sub_orphan", "pi_orphan").await.unwrap();
        assert_eq!(outcome.subscription().account_id, account_id);
    }
}

// =============================================================================
// Compensation: verified money, failed commit
// =============================================================================
mod compensation_tests {
    use super::support::*;
    use crate::error::BillingError;
    use crate::gateway::{PurchaseKind, SessionMode, SessionView};
    use crate::notify::BillingNotice;
    use crate::types::{BillingCycle, PaymentStatus};
    use bidcraft_shared::AccountRole;

    // =========================================================================
    // Store commit failure after verified payment triggers a refund
    // =========================================================================
    #[tokio::test]
    async fn test_commit_failure_refunds_payment() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);
        eng.store.inject_commit_failures(1).await;

        let err = eng
            .activation
            .activate_session(&session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ActivationRefunded(_)));
        assert_eq!(eng.gateway.created_refund_count(), 1);

        let payments = eng.store.payments_for(account_id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::PendingRefund);
        assert!(payments[0].refund_ref.is_some());

        let refunded = eng
            .sink
            .notices()
            .iter()
            .any(|n| matches!(n, BillingNotice::RefundIssued { .. }));
        assert!(refunded, "refund notice emitted");
    }

    // =========================================================================
    // Replaying a compensated payment reports the refund, not a subscription
    // =========================================================================
    #[tokio::test]
    async fn test_replay_after_compensation_reports_refund() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);
        eng.store.inject_commit_failures(1).await;

        let _ = eng.activation.activate_session(&session_id).await;
        let err = eng
            .activation
            .activate_session(&session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ActivationRefunded(_)));
        assert_eq!(
            eng.gateway.created_refund_count(),
            1,
            "replay must not refund twice"
        );
    }

    // =========================================================================
    // Existing refund short-circuits: never refund the same charge twice
    // =========================================================================
    #[tokio::test]
    async fn test_double_refund_guard() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);
        eng.store.inject_commit_failures(1).await;
        eng.gateway.put_existing_refund("pi_initial_1", "re_manual");

        let err = eng
            .activation
            .activate_session(&session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ActivationRefunded(_)));
        assert_eq!(
            eng.gateway.created_refund_count(),
            0,
            "pre-existing refund found, no new refund created"
        );
    }

    // =========================================================================
    // Refund creation failure escalates to manual intervention
    // =========================================================================
    #[tokio::test]
    async fn test_unrefundable_commit_failure_escalates() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);
        eng.store.inject_commit_failures(1).await;
        eng.gateway.fail_refunds();

        let err = eng
            .activation
            .activate_session(&session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::CompensationRequired(_)));

        let payments = eng.store.payments_for(account_id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(
            payments[0].status,
            PaymentStatus::RefundRequired,
            "terminal audit row for the operator"
        );

        let paged = eng
            .sink
            .notices()
            .iter()
            .any(|n| matches!(n, BillingNotice::RefundRequired { .. }));
        assert!(paged, "operator notice emitted");
    }

    // =========================================================================
    // Add-on paid with no live subscription: money goes back
    // =========================================================================
    #[tokio::test]
    async fn test_addon_without_subscription_is_refunded() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_account(profile).await;

        let meta = crate::gateway::CheckoutMetadata {
            account_id,
            plan_name: "rfp_pack_10".into(),
            billing_cycle: BillingCycle::Monthly,
            expected_price_ref: None,
            kind: PurchaseKind::Addon,
            addon_id: Some("rfp_pack_10".into()),
        };
        eng.gateway.put_session(SessionView {
            session_id: "cs_addon".into(),
            mode: SessionMode::OneTime,
            paid: true,
            payment_ref: Some("pi_addon".into()),
            subscription_ref: None,
            customer_ref: Some("cus_owner".into()),
            amount_total_cents: Some(1500),
            metadata: meta.to_map(),
        });

        let err = eng
            .activation
            .activate_session("cs_addon")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ActivationRefunded(_)));
        assert_eq!(eng.gateway.created_refund_count(), 1);
    }
}

// =============================================================================
// Webhook dispatch: auth, claims, routing
// =============================================================================
mod webhook_tests {
    use super::support::*;
    use crate::error::BillingError;
    use crate::notify::BillingNotice;
    use crate::store::EntitlementStore;
    use crate::types::{NewPayment, PaymentStatus};
    use bidcraft_shared::{AccountRole, BillingStatus};
    use serde_json::json;

    // =========================================================================
    // checkout.session.completed activates through the dispatcher
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_completed_event_activates() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);

        let payload = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1700000000,
            "data": {"object": {"id": session_id}}
        })
        .to_string();

        eng.dispatcher.handle(&payload, "sig").await.unwrap();
        assert!(eng
            .store
            .subscription_by_owner(account_id)
            .await
            .unwrap()
            .is_some());

        // Redelivery of the same event id is claimed away
        eng.dispatcher.handle(&payload, "sig").await.unwrap();
        let success_rows = eng
            .store
            .payments_for(account_id)
            .await
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Success)
            .count();
        assert_eq!(success_rows, 1, "duplicate delivery processed once");
    }

    // =========================================================================
    // Invalid signature is the one case that must NOT be acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_signature_rejected() {
        let eng = engine();
        let err = eng
            .dispatcher
            .handle(r#"{"id":"evt_x","type":"invoice.paid"}"#, "invalid")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    // =========================================================================
    // Downstream processing failure is recorded but still acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_processing_failure_still_acknowledged() {
        let eng = engine();
        let payload = json!({
            "id": "evt_broken",
            "type": "invoice.paid",
            "created": 1700000000,
            "data": {"object": {
                "id": "in_1",
                "billing_reason": "subscription_cycle",
                "subscription": "sub_missing",
                "payment_intent": "pi_missing"
            }}
        })
        .to_string();

        // The gateway has no such subscription; processing fails internally
        let result = eng.dispatcher.handle(&payload, "sig").await;
        assert!(result.is_ok(), "authenticated deliveries are acknowledged");
    }

    // =========================================================================
    // A lost completion-bookkeeping write never un-acknowledges a processed
    // delivery
    // =========================================================================
    #[tokio::test]
    async fn test_finish_bookkeeping_failure_still_acknowledged() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, _) = seed_paid_checkout(&eng.gateway, account_id);

        let payload = json!({
            "id": "evt_finish_lost",
            "type": "checkout.session.completed",
            "created": 1700000000,
            "data": {"object": {"id": session_id}}
        })
        .to_string();

        eng.store.inject_finish_failures(1).await;
        let result = eng.dispatcher.handle(&payload, "sig").await;
        assert!(
            result.is_ok(),
            "activation committed, delivery must be acknowledged"
        );
        assert!(eng
            .store
            .subscription_by_owner(account_id)
            .await
            .unwrap()
            .is_some());
    }

    // =========================================================================
    // invoice.payment_failed suspends renewal and flags past-due
    // =========================================================================
    #[tokio::test]
    async fn test_renewal_failure_marks_past_due() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, sub_ref) = seed_paid_checkout(&eng.gateway, account_id);
        eng.activation.activate_session(&session_id).await.unwrap();

        let payload = json!({
            "id": "evt_fail",
            "type": "invoice.payment_failed",
            "created": 1700000000,
            "data": {"object": {
                "id": "in_2",
                "subscription": sub_ref,
                "last_payment_error": {"message": "card declined"}
            }}
        })
        .to_string();
        eng.dispatcher.handle(&payload, "sig").await.unwrap();

        let sub = eng
            .store
            .subscription_by_owner(account_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!sub.auto_renew, "auto-renew suspended");
        assert!(
            sub.canceled_at.is_none(),
            "entitlements stay until the paid-through date"
        );
        let status = eng
            .store
            .account_profile(account_id)
            .await
            .unwrap()
            .unwrap()
            .billing_status;
        assert_eq!(status, BillingStatus::PastDue);

        let failed_rows = eng
            .store
            .payments_for(account_id)
            .await
            .into_iter()
            .filter(|p| p.status == PaymentStatus::Failed)
            .count();
        assert_eq!(failed_rows, 1);

        let notified = eng
            .sink
            .notices()
            .iter()
            .any(|n| matches!(n, BillingNotice::RenewalFailed { .. }));
        assert!(notified);
    }

    // =========================================================================
    // customer.subscription.deleted cancels locally
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_deleted_cancels() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, sub_ref) = seed_paid_checkout(&eng.gateway, account_id);
        eng.activation.activate_session(&session_id).await.unwrap();

        let payload = json!({
            "id": "evt_del",
            "type": "customer.subscription.deleted",
            "created": 1700000000,
            "data": {"object": {"id": sub_ref}}
        })
        .to_string();
        eng.dispatcher.handle(&payload, "sig").await.unwrap();

        let sub = eng
            .store
            .subscription_by_owner(account_id)
            .await
            .unwrap()
            .unwrap();
        assert!(sub.canceled_at.is_some());
        let status = eng
            .store
            .account_profile(account_id)
            .await
            .unwrap()
            .unwrap()
            .billing_status;
        assert_eq!(status, BillingStatus::Inactive);
    }

    // =========================================================================
    // checkout.session.expired cleans up the pending payment row
    // =========================================================================
    #[tokio::test]
    async fn test_expired_session_cleans_pending_row() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_account(profile).await;

        eng.store
            .record_payment(NewPayment {
                account_id,
                subscription_id: None,
                amount_cents: 1500,
                status: PaymentStatus::Pending,
                gateway_txn_ref: None,
                gateway_session_ref: Some("cs_expired".into()),
                refund_ref: None,
                failure_reason: None,
                plan_name: "rfp_pack_10".into(),
                payer_name: "Avery Owner".into(),
            })
            .await
            .unwrap();

        let payload = json!({
            "id": "evt_exp",
            "type": "checkout.session.expired",
            "created": 1700000000,
            "data": {"object": {"id": "cs_expired"}}
        })
        .to_string();
        eng.dispatcher.handle(&payload, "sig").await.unwrap();

        let payments = eng.store.payments_for(account_id).await;
        assert_eq!(payments[0].status, PaymentStatus::Failed);
        assert_eq!(
            payments[0].failure_reason.as_deref(),
            Some("checkout session expired")
        );
    }
}

// =============================================================================
// Price sync: repricing and subscription migration
// =============================================================================
mod sync_tests {
    use super::support::*;
    use crate::gateway::PriceView;
    use crate::store::EntitlementStore;
    use bidcraft_shared::AccountRole;

    // =========================================================================
    // Gateway price change updates the plan and migrates live subscriptions
    // =========================================================================
    #[tokio::test]
    async fn test_price_change_updates_plan_and_migrates() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;
        let (session_id, sub_ref) = seed_paid_checkout(&eng.gateway, account_id);
        eng.activation.activate_session(&session_id).await.unwrap();

        eng.gateway.put_price(PriceView {
            price_ref: "price_basic_m2".into(),
            product_ref: "prod_basic".into(),
            amount_cents: 3100,
            currency: "usd".into(),
            recurring_interval: Some("month".into()),
        });

        let report = eng.sync.sync_price("price_basic_m2").await.unwrap();
        assert_eq!(report.prices_updated, 1);
        assert_eq!(report.subscriptions_migrated, 1);
        assert!(report.errors.is_empty());

        let plan = eng.store.plan_by_name("Basic").await.unwrap().unwrap();
        assert_eq!(plan.monthly_price_cents, 3100);
        assert_eq!(plan.gateway_price_monthly.as_deref(), Some("price_basic_m2"));

        let moves = eng.gateway.price_moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, sub_ref);

        let sub = eng
            .store
            .subscription_by_owner(account_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.gateway_price_ref.as_deref(), Some("price_basic_m2"));
        assert_eq!(
            sub.price_cents, 2900,
            "snapshotted term price is never rewritten"
        );
    }

    // =========================================================================
    // Per-subscription migration failures are skipped, not fatal
    // =========================================================================
    #[tokio::test]
    async fn test_migration_skips_failing_subscription() {
        let eng = engine();
        let profile_a = owner(AccountRole::Owner);
        let mut profile_b = owner(AccountRole::Owner);
        profile_b.email = "second@bidcraft.test".into();
        let (account_a, account_b) = (profile_a.id, profile_b.id);
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile_a).await;
        eng.store.insert_account(profile_b).await;

        // Two live subscriptions on the old monthly price
        for (account_id, sub_ref, txn) in [
            (account_a, "sub_gw_a", "pi_a"),
            (account_b, "sub_gw_b", "pi_b"),
        ] {
            let now = time::OffsetDateTime::now_utc();
            eng.store
                .commit_activation(crate::store::ActivationCommit {
                    account_id,
                    plan_name: "Basic".into(),
                    price_cents: 2900,
                    billing_cycle: crate::types::BillingCycle::Monthly,
                    start_date: now,
                    end_date: now + time::Duration::days(30),
                    renewal_date: Some(now + time::Duration::days(30)),
                    auto_renew: true,
                    gateway_subscription_ref: Some(sub_ref.into()),
                    gateway_price_ref: Some("price_basic_m".into()),
                    gateway_product_ref: Some("prod_basic".into()),
                    quotas: Default::default(),
                    payment: crate::types::NewPayment {
                        account_id,
                        subscription_id: None,
                        amount_cents: 2900,
                        status: crate::types::PaymentStatus::Success,
                        gateway_txn_ref: Some(txn.into()),
                        gateway_session_ref: None,
                        refund_ref: None,
                        failure_reason: None,
                        plan_name: "Basic".into(),
                        payer_name: "Avery Owner".into(),
                    },
                })
                .await
                .unwrap();
        }
        eng.gateway.fail_price_update_for("sub_gw_a");

        eng.gateway.put_price(PriceView {
            price_ref: "price_basic_m2".into(),
            product_ref: "prod_basic".into(),
            amount_cents: 3100,
            currency: "usd".into(),
            recurring_interval: Some("month".into()),
        });

        let report = eng.sync.sync_price("price_basic_m2").await.unwrap();
        assert_eq!(report.subscriptions_migrated, 1, "healthy sub migrated");
        assert_eq!(report.errors.len(), 1, "failing sub reported, not fatal");

        let migrated = eng
            .store
            .subscription_by_owner(account_b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            migrated.gateway_price_ref.as_deref(),
            Some("price_basic_m2")
        );
        let skipped = eng
            .store
            .subscription_by_owner(account_a)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            skipped.gateway_price_ref.as_deref(),
            Some("price_basic_m"),
            "failed migration leaves the old ref for the next run"
        );
    }

    // =========================================================================
    // Price for a product with no local plan is ignored
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_product_price_ignored() {
        let eng = engine();
        eng.gateway.put_price(PriceView {
            price_ref: "price_other".into(),
            product_ref: "prod_unknown".into(),
            amount_cents: 999,
            currency: "usd".into(),
            recurring_interval: Some("month".into()),
        });

        let report = eng.sync.sync_price("price_other").await.unwrap();
        assert_eq!(report.prices_updated, 0);
        assert!(report.errors.is_empty());
    }
}

// =============================================================================
// Checkout initiation: authorization and validation
// =============================================================================
mod checkout_tests {
    use super::support::*;
    use crate::error::BillingError;
    use crate::store::EntitlementStore;
    use crate::types::{BillingCycle, PaymentStatus};
    use bidcraft_shared::AccountRole;

    // =========================================================================
    // Only billing-capable roles can start checkout
    // =========================================================================
    #[tokio::test]
    async fn test_editor_cannot_start_checkout() {
        let eng = engine();
        let profile = owner(AccountRole::Editor);
        let account_id = profile.id;
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;

        let err = eng
            .checkout
            .start_plan_checkout(account_id, "Basic", BillingCycle::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    // =========================================================================
    // Unknown and unpriced plans are distinct failures
    // =========================================================================
    #[tokio::test]
    async fn test_plan_validation_errors() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.gateway.put_customer("cus_owner");
        let mut unpriced = basic_plan();
        unpriced.name = "Unpriced".into();
        unpriced.gateway_price_monthly = None;
        eng.store.insert_plan(unpriced).await;
        eng.store.insert_account(profile).await;

        let missing = eng
            .checkout
            .start_plan_checkout(account_id, "Nope", BillingCycle::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(missing, BillingError::PlanNotFound(_)));

        let unconfigured = eng
            .checkout
            .start_plan_checkout(account_id, "Unpriced", BillingCycle::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(unconfigured, BillingError::MissingPriceConfig(_)));
    }

    // =========================================================================
    // Stale gateway customer refs are replaced transparently
    // =========================================================================
    #[tokio::test]
    async fn test_stale_customer_ref_recreated() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        // "cus_owner" is NOT registered with the mock gateway
        eng.store.insert_plan(basic_plan()).await;
        eng.store.insert_account(profile).await;

        let response = eng
            .checkout
            .start_plan_checkout(account_id, "Basic", BillingCycle::Monthly)
            .await
            .unwrap();
        assert!(!response.session_id.is_empty());

        let refreshed = eng
            .store
            .account_profile(account_id)
            .await
            .unwrap()
            .unwrap();
        let new_ref = refreshed.gateway_customer_ref.unwrap();
        assert_ne!(new_ref, "cus_owner", "stale ref replaced");
        assert!(new_ref.starts_with("cus_mock_"));
    }

    // =========================================================================
    // Add-ons require a live subscription to extend
    // =========================================================================
    #[tokio::test]
    async fn test_addon_checkout_requires_live_subscription() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.gateway.put_customer("cus_owner");
        eng.store.insert_account(profile).await;

        let err = eng
            .checkout
            .start_addon_checkout(account_id, "rfp_pack_10")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    // =========================================================================
    // Custom plan checkout records a pending audit row for the session
    // =========================================================================
    #[tokio::test]
    async fn test_custom_plan_checkout_records_pending_row() {
        let eng = engine();
        let profile = owner(AccountRole::Owner);
        let account_id = profile.id;
        eng.gateway.put_customer("cus_owner");
        eng.store.insert_plan(custom_plan()).await;
        eng.store.insert_account(profile).await;

        let response = eng
            .checkout
            .start_custom_plan_checkout(account_id, "Enterprise", BillingCycle::Yearly)
            .await
            .unwrap();

        let payments = eng.store.payments_for(account_id).await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Pending);
        assert_eq!(
            payments[0].gateway_session_ref.as_deref(),
            Some(response.session_id.as_str())
        );
        assert_eq!(payments[0].amount_cents, 2_500_000);
    }
}
