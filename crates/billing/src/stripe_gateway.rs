//! Stripe implementation of the payment gateway port
//!
//! Read-only fetches retry transient client errors with bounded backoff.
//! Writes (customer, session, refund creation) are never auto-retried; the
//! engine's idempotency handles caller-level retries instead.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{
    Charge, CheckoutSession, CheckoutSessionMode, CheckoutSessionPaymentStatus, Client,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, CreateCheckoutSessionPaymentIntentData,
    CreateCheckoutSessionSubscriptionData, CreateCustomer, CreateRefund, Currency, Customer,
    Expandable, ListCharges, ListRefunds, Object, PaymentIntent, PaymentIntentStatus, Price,
    Refund, RefundReasonFilter, Subscription as StripeSubscription, UpdateSubscription,
    UpdateSubscriptionItems,
};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeView, CustomerSpec, EventEnvelope, GatewayPaymentStatus, GatewaySubscriptionView,
    PaymentGateway, PaymentView, PriceView, RefundSpec, SessionHandle, SessionMode, SessionSpec,
    SessionView,
};

type HmacSha256 = Hmac<Sha256>;

/// Webhook timestamp tolerance in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: require_env("STRIPE_SECRET_KEY")?,
            webhook_secret: require_env("STRIPE_WEBHOOK_SECRET")?,
            success_url: require_env("CHECKOUT_SUCCESS_URL")?,
            cancel_url: require_env("CHECKOUT_CANCEL_URL")?,
        })
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} is not set", name)))
}

pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Retry transient failures on read-only calls. Three attempts with
    /// exponential backoff starting at 200ms.
    async fn retry_read<T, F, Fut>(&self, op: F) -> Result<T, stripe::StripeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, stripe::StripeError>>,
    {
        let strategy = ExponentialBackoff::from_millis(200).factor(2).take(2);
        RetryIf::spawn(strategy, op, |e: &stripe::StripeError| {
            matches!(
                e,
                stripe::StripeError::ClientError(_) | stripe::StripeError::Timeout
            )
        })
        .await
    }
}

fn expandable_ref<T: Object>(e: &Expandable<T>) -> String
where
    T::Id: ToString,
{
    match e {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(obj) => obj.id().to_string(),
    }
}

fn map_payment_status(status: PaymentIntentStatus) -> GatewayPaymentStatus {
    match status {
        PaymentIntentStatus::Succeeded => GatewayPaymentStatus::Succeeded,
        PaymentIntentStatus::Processing => GatewayPaymentStatus::Processing,
        PaymentIntentStatus::Canceled => GatewayPaymentStatus::Canceled,
        PaymentIntentStatus::RequiresAction
        | PaymentIntentStatus::RequiresCapture
        | PaymentIntentStatus::RequiresConfirmation
        | PaymentIntentStatus::RequiresPaymentMethod => GatewayPaymentStatus::RequiresAction,
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, spec: &CustomerSpec) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), spec.account_id.to_string());

        let params = CreateCustomer {
            email: Some(&spec.email),
            name: Some(&spec.display_name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(&self.client, params).await?;

        tracing::info!(
            account_id = %spec.account_id,
            customer_ref = %customer.id,
            "Created gateway customer"
        );

        Ok(customer.id.to_string())
    }

    async fn customer_exists(&self, customer_ref: &str) -> BillingResult<bool> {
        let customer_id = customer_ref
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::Gateway(format!("Invalid customer ref: {}", e)))?;

        match self
            .retry_read(|| Customer::retrieve(&self.client, &customer_id, &[]))
            .await
        {
            Ok(customer) => Ok(!customer.deleted),
            Err(stripe::StripeError::Stripe(req)) if req.http_status == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_checkout_session(&self, spec: &SessionSpec) -> BillingResult<SessionHandle> {
        let customer_id = spec
            .customer_ref
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::Gateway(format!("Invalid customer ref: {}", e)))?;

        let metadata = spec.metadata.to_map();

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.success_url = Some(&spec.success_url);
        params.cancel_url = Some(&spec.cancel_url);
        params.metadata = Some(metadata.clone());

        match spec.mode {
            SessionMode::Subscription => {
                let price_ref = spec.price_ref.as_deref().ok_or_else(|| {
                    BillingError::Gateway("Subscription session requires a price ref".to_string())
                })?;
                params.mode = Some(CheckoutSessionMode::Subscription);
                params.line_items = Some(vec![CreateCheckoutSessionLineItems {
                    price: Some(price_ref.to_string()),
                    quantity: Some(1),
                    ..Default::default()
                }]);
                // Metadata on the subscription itself lets renewal invoices
                // be traced back to the owner without a session lookup.
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(metadata),
                    ..Default::default()
                });
            }
            SessionMode::OneTime => {
                let amount = spec.amount_cents.ok_or_else(|| {
                    BillingError::Gateway("One-time session requires an amount".to_string())
                })?;
                params.mode = Some(CheckoutSessionMode::Payment);
                params.line_items = Some(vec![CreateCheckoutSessionLineItems {
                    price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                        currency: Currency::USD,
                        unit_amount: Some(amount),
                        product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                            name: spec.description.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    quantity: Some(1),
                    ..Default::default()
                }]);
                params.payment_intent_data = Some(CreateCheckoutSessionPaymentIntentData {
                    metadata: Some(metadata),
                    ..Default::default()
                });
            }
        }

        let session = CheckoutSession::create(&self.client, params).await?;

        let redirect_url = session
            .url
            .clone()
            .ok_or_else(|| BillingError::Gateway("Session has no redirect URL".to_string()))?;

        tracing::info!(
            account_id = %spec.metadata.account_id,
            session_id = %session.id,
            mode = %spec.mode.as_str(),
            "Created checkout session"
        );

        Ok(SessionHandle {
            session_id: session.id.to_string(),
            redirect_url,
        })
    }

    async fn fetch_payment(&self, txn_ref: &str) -> BillingResult<PaymentView> {
        let intent_id = txn_ref
            .parse::<stripe::PaymentIntentId>()
            .map_err(|e| BillingError::Verification(format!("Invalid payment ref: {}", e)))?;

        let intent = self
            .retry_read(|| PaymentIntent::retrieve(&self.client, &intent_id, &[]))
            .await?;

        Ok(PaymentView {
            txn_ref: intent.id.to_string(),
            status: map_payment_status(intent.status),
            amount_cents: intent.amount,
            currency: intent.currency.to_string(),
            charge_ref: intent.latest_charge.as_ref().map(expandable_ref),
            customer_ref: intent.customer.as_ref().map(expandable_ref),
            metadata: intent.metadata.clone(),
            created_unix: intent.created,
        })
    }

    async fn fetch_checkout_session(&self, session_id: &str) -> BillingResult<SessionView> {
        let id = session_id
            .parse::<stripe::CheckoutSessionId>()
            .map_err(|e| BillingError::Verification(format!("Invalid session ref: {}", e)))?;

        let session = self
            .retry_read(|| CheckoutSession::retrieve(&self.client, &id, &[]))
            .await?;

        let mode = match session.mode {
            CheckoutSessionMode::Subscription => SessionMode::Subscription,
            _ => SessionMode::OneTime,
        };

        Ok(SessionView {
            session_id: session.id.to_string(),
            mode,
            paid: session.payment_status == CheckoutSessionPaymentStatus::Paid,
            payment_ref: session.payment_intent.as_ref().map(expandable_ref),
            subscription_ref: session.subscription.as_ref().map(expandable_ref),
            customer_ref: session.customer.as_ref().map(expandable_ref),
            amount_total_cents: session.amount_total,
            metadata: session.metadata.clone().unwrap_or_default(),
        })
    }

    async fn fetch_subscription(&self, sub_ref: &str) -> BillingResult<GatewaySubscriptionView> {
        let sub_id = sub_ref
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Verification(format!("Invalid subscription ref: {}", e)))?;

        let sub = self
            .retry_read(|| StripeSubscription::retrieve(&self.client, &sub_id, &[]))
            .await?;

        let item_price = sub.items.data.first().and_then(|item| item.price.as_ref());

        Ok(GatewaySubscriptionView {
            subscription_ref: sub.id.to_string(),
            status: sub.status.to_string(),
            customer_ref: expandable_ref(&sub.customer),
            price_ref: item_price.map(|p| p.id.to_string()),
            product_ref: item_price
                .and_then(|p| p.product.as_ref())
                .map(expandable_ref),
            period_start_unix: sub.current_period_start,
            period_end_unix: sub.current_period_end,
            metadata: sub.metadata.clone(),
        })
    }

    async fn fetch_price(&self, price_ref: &str) -> BillingResult<PriceView> {
        let price_id = price_ref
            .parse::<stripe::PriceId>()
            .map_err(|e| BillingError::Gateway(format!("Invalid price ref: {}", e)))?;

        let price = self
            .retry_read(|| Price::retrieve(&self.client, &price_id, &[]))
            .await?;

        let amount_cents = price
            .unit_amount
            .ok_or_else(|| BillingError::Gateway(format!("Price {} has no amount", price_ref)))?;
        let product_ref = price
            .product
            .as_ref()
            .map(expandable_ref)
            .ok_or_else(|| BillingError::Gateway(format!("Price {} has no product", price_ref)))?;

        Ok(PriceView {
            price_ref: price.id.to_string(),
            product_ref,
            amount_cents,
            currency: price.currency.map(|c| c.to_string()).unwrap_or_default(),
            recurring_interval: price.recurring.as_ref().map(|r| r.interval.to_string()),
        })
    }

    fn is_transaction_ref(&self, reference: &str) -> bool {
        reference.starts_with("pi_")
    }

    fn is_charge_ref(&self, reference: &str) -> bool {
        reference.starts_with("ch_")
    }

    async fn find_refund_for(&self, reference: &str) -> BillingResult<Option<String>> {
        let mut params = ListRefunds::new();
        if self.is_transaction_ref(reference) {
            params.payment_intent = Some(
                reference
                    .parse()
                    .map_err(|e| BillingError::Gateway(format!("Invalid payment ref: {}", e)))?,
            );
        } else {
            params.charge = Some(
                reference
                    .parse()
                    .map_err(|e| BillingError::Gateway(format!("Invalid charge ref: {}", e)))?,
            );
        }
        params.limit = Some(1);

        let refunds = self.retry_read(|| Refund::list(&self.client, &params)).await?;
        Ok(refunds.data.first().map(|r| r.id.to_string()))
    }

    async fn create_refund(&self, spec: &RefundSpec) -> BillingResult<String> {
        let mut params = CreateRefund::new();
        if let Some(intent_ref) = &spec.payment_intent_ref {
            params.payment_intent = Some(
                intent_ref
                    .parse()
                    .map_err(|e| BillingError::RefundFailed(format!("Invalid payment ref: {}", e)))?,
            );
        } else if let Some(charge_ref) = &spec.charge_ref {
            params.charge = Some(
                charge_ref
                    .parse()
                    .map_err(|e| BillingError::RefundFailed(format!("Invalid charge ref: {}", e)))?,
            );
        } else {
            return Err(BillingError::RefundFailed(
                "No refundable reference provided".to_string(),
            ));
        }
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);

        let mut metadata = spec.metadata.clone();
        metadata.insert("reason_detail".to_string(), spec.reason.clone());
        params.metadata = Some(metadata);

        let refund = Refund::create(&self.client, params)
            .await
            .map_err(|e| BillingError::RefundFailed(e.to_string()))?;

        tracing::warn!(
            refund_ref = %refund.id,
            reason = %spec.reason,
            "Created gateway refund"
        );

        Ok(refund.id.to_string())
    }

    async fn recent_charges(
        &self,
        customer_ref: &str,
        limit: u8,
    ) -> BillingResult<Vec<ChargeView>> {
        let customer_id = customer_ref
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::Gateway(format!("Invalid customer ref: {}", e)))?;

        let mut params = ListCharges::new();
        params.customer = Some(customer_id);
        params.limit = Some(u64::from(limit));

        let charges = self.retry_read(|| Charge::list(&self.client, &params)).await?;

        Ok(charges
            .data
            .iter()
            .map(|charge| ChargeView {
                charge_ref: charge.id.to_string(),
                payment_intent_ref: charge.payment_intent.as_ref().map(expandable_ref),
                amount_cents: charge.amount,
                created_unix: charge.created,
                refunded: charge.refunded,
            })
            .collect())
    }

    async fn update_subscription_price(
        &self,
        sub_ref: &str,
        old_price_ref: &str,
        new_price_ref: &str,
    ) -> BillingResult<()> {
        let sub_id = sub_ref
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Gateway(format!("Invalid subscription ref: {}", e)))?;

        let current = StripeSubscription::retrieve(&self.client, &sub_id, &[]).await?;

        let item = current
            .items
            .data
            .iter()
            .find(|item| {
                item.price
                    .as_ref()
                    .is_some_and(|p| p.id.as_str() == old_price_ref)
            })
            .ok_or_else(|| {
                BillingError::Gateway(format!(
                    "Subscription {} has no item on price {}",
                    sub_ref, old_price_ref
                ))
            })?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item.id.to_string()),
                price: Some(new_price_ref.to_string()),
                ..Default::default()
            }]),
            // No proration: the new price applies from the next renewal.
            proration_behavior: Some(SubscriptionProrationBehavior::None),
            ..Default::default()
        };

        StripeSubscription::update(&self.client, &sub_id, params).await?;

        tracing::info!(
            subscription_ref = %sub_ref,
            old_price = %old_price_ref,
            new_price = %new_price_ref,
            "Migrated subscription to new price"
        );

        Ok(())
    }

    /// Manual signature verification against the raw payload.
    ///
    /// Header format: `t=<unix>,v1=<hex hmac>`. The signed payload is
    /// `"{timestamp}.{body}"` keyed by the webhook secret (without its
    /// `whsec_` prefix). Timestamps outside the tolerance window are
    /// rejected to limit replay.
    fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<EventEnvelope> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!("System time error: {}", e);
                BillingError::WebhookSignatureInvalid
            })?
            .as_secs() as i64;

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = self
            .config
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.config.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let claimed = hex::decode(&v1_signature).map_err(|_| {
            tracing::error!("Webhook signature is not valid hex");
            BillingError::WebhookSignatureInvalid
        })?;

        // Constant-time comparison via the mac itself.
        if mac.verify_slice(&claimed).is_err() {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let raw: serde_json::Value = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        let event_id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or(BillingError::WebhookSignatureInvalid)?
            .to_string();
        let event_type = raw
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(BillingError::WebhookSignatureInvalid)?
            .to_string();
        let created_unix = raw.get("created").and_then(|v| v.as_i64()).unwrap_or(now);
        let object = raw
            .get("data")
            .and_then(|d| d.get("object"))
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        tracing::debug!(
            event_id = %event_id,
            event_type = %event_type,
            "Webhook signature verified"
        );

        Ok(EventEnvelope {
            event_id,
            event_type,
            created_unix,
            object,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway(secret: &str) -> StripeGateway {
        StripeGateway::new(StripeConfig {
            secret_key: "sk_test_abc".to_string(),
            webhook_secret: secret.to_string(),
            success_url: "https://app.test/billing/success".to_string(),
            cancel_url: "https://app.test/billing/cancel".to_string(),
        })
    }

    fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn now_unix() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    const PAYLOAD: &str = r#"{
        "id": "evt_test_1",
        "type": "invoice.paid",
        "created": 1700000000,
        "data": { "object": { "subscription": "sub_123" } }
    }"#;

    #[test]
    fn test_verify_event_accepts_valid_signature() {
        let gateway = test_gateway("whsec_testsecret");
        let ts = now_unix();
        let header = format!("t={},v1={}", ts, sign("whsec_testsecret", ts, PAYLOAD));

        let envelope = gateway.verify_event(PAYLOAD, &header).unwrap();
        assert_eq!(envelope.event_id, "evt_test_1");
        assert_eq!(envelope.event_type, "invoice.paid");
        assert_eq!(envelope.object["subscription"], "sub_123");
    }

    #[test]
    fn test_verify_event_rejects_tampered_payload() {
        let gateway = test_gateway("whsec_testsecret");
        let ts = now_unix();
        let header = format!("t={},v1={}", ts, sign("whsec_testsecret", ts, PAYLOAD));

        let tampered = PAYLOAD.replace("sub_123", "sub_999");
        let err = gateway.verify_event(&tampered, &header).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_verify_event_rejects_wrong_secret() {
        let gateway = test_gateway("whsec_other");
        let ts = now_unix();
        let header = format!("t={},v1={}", ts, sign("whsec_testsecret", ts, PAYLOAD));

        let err = gateway.verify_event(PAYLOAD, &header).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_verify_event_rejects_stale_timestamp() {
        let gateway = test_gateway("whsec_testsecret");
        let ts = now_unix() - 3600;
        let header = format!("t={},v1={}", ts, sign("whsec_testsecret", ts, PAYLOAD));

        let err = gateway.verify_event(PAYLOAD, &header).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_verify_event_rejects_malformed_header() {
        let gateway = test_gateway("whsec_testsecret");
        let err = gateway.verify_event(PAYLOAD, "garbage").unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_verify_event_rejects_non_hex_signature() {
        let gateway = test_gateway("whsec_testsecret");
        let header = format!("t={},v1=not-hex-at-all", now_unix());
        let err = gateway.verify_event(PAYLOAD, &header).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_reference_classification() {
        let gateway = test_gateway("whsec_testsecret");
        assert!(gateway.is_transaction_ref("pi_123"));
        assert!(!gateway.is_transaction_ref("ch_123"));
        assert!(gateway.is_charge_ref("ch_123"));
        assert!(!gateway.is_charge_ref("cs_123"));
    }
}
