//! Webhook dispatch
//!
//! Verifies event authenticity, claims exclusive processing rights per
//! event id, classifies the event, and routes it to the engine. Payload
//! contents are used only for routing (which reference to re-fetch), never
//! for entitlement decisions. After authentication succeeds the delivery
//! is always acknowledged; downstream failures are recorded on the event
//! row and retried via the gateway's own redelivery.

use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;

use crate::activation::ActivationService;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{EventEnvelope, PaymentGateway};
use crate::store::EntitlementStore;
use crate::sync::PriceSyncService;

/// Routing classification for an authenticated event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClass {
    CheckoutCompleted { session_id: String },
    CheckoutExpired { session_id: String },
    RenewalSucceeded { subscription_ref: String, txn_ref: String },
    RenewalFailed { subscription_ref: String, failure_reason: String },
    Canceled { subscription_ref: String },
    PriceChanged { price_ref: String },
    ProductChanged { product_ref: String },
    Ignored,
}

/// Reference fields arrive either as a bare string or as an expanded
/// object carrying an `id`.
fn ref_field(object: &Value, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(|v| v.as_str()).map(String::from),
        _ => None,
    }
}

fn object_id(object: &Value) -> Option<String> {
    object.get("id").and_then(|v| v.as_str()).map(String::from)
}

/// Subscription reference on an invoice: the top-level field, with a
/// fallback through the first line item for newer payload shapes.
fn invoice_subscription_ref(object: &Value) -> Option<String> {
    if let Some(sub_ref) = ref_field(object, "subscription") {
        return Some(sub_ref);
    }
    object
        .get("lines")
        .and_then(|lines| lines.get("data"))
        .and_then(|data| data.as_array())
        .and_then(|items| {
            items.iter().find_map(|item| {
                ref_field(item, "subscription")
                    .or_else(|| ref_field(item.get("parent")?, "subscription"))
            })
        })
}

impl EventClass {
    pub fn classify(event_type: &str, object: &Value) -> EventClass {
        match event_type {
            "checkout.session.completed" => match object_id(object) {
                Some(session_id) => EventClass::CheckoutCompleted { session_id },
                None => EventClass::Ignored,
            },
            "checkout.session.expired" => match object_id(object) {
                Some(session_id) => EventClass::CheckoutExpired { session_id },
                None => EventClass::Ignored,
            },
            "invoice.paid" | "invoice.payment_succeeded" => {
                // The initial invoice of a new subscription is covered by the
                // checkout-completed path; only renewals route here.
                let billing_reason = object
                    .get("billing_reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if billing_reason == "subscription_create" {
                    return EventClass::Ignored;
                }
                match (
                    invoice_subscription_ref(object),
                    ref_field(object, "payment_intent"),
                ) {
                    (Some(subscription_ref), Some(txn_ref)) => EventClass::RenewalSucceeded {
                        subscription_ref,
                        txn_ref,
                    },
                    _ => EventClass::Ignored,
                }
            }
            "invoice.payment_failed" => match invoice_subscription_ref(object) {
                Some(subscription_ref) => {
                    let failure_reason = object
                        .get("last_payment_error")
                        .and_then(|e| e.get("message"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("renewal payment failed")
                        .to_string();
                    EventClass::RenewalFailed {
                        subscription_ref,
                        failure_reason,
                    }
                }
                None => EventClass::Ignored,
            },
            "customer.subscription.deleted" => match object_id(object) {
                Some(subscription_ref) => EventClass::Canceled { subscription_ref },
                None => EventClass::Ignored,
            },
            "price.updated" | "price.created" => match object_id(object) {
                Some(price_ref) => EventClass::PriceChanged { price_ref },
                None => EventClass::Ignored,
            },
            "product.updated" => match object_id(object) {
                Some(product_ref) => EventClass::ProductChanged { product_ref },
                None => EventClass::Ignored,
            },
            _ => EventClass::Ignored,
        }
    }
}

pub struct WebhookDispatcher {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn EntitlementStore>,
    activation: Arc<ActivationService>,
    sync: Arc<PriceSyncService>,
}

impl WebhookDispatcher {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn EntitlementStore>,
        activation: Arc<ActivationService>,
        sync: Arc<PriceSyncService>,
    ) -> Self {
        Self {
            gateway,
            store,
            activation,
            sync,
        }
    }

    /// Authenticate and process one delivery.
    ///
    /// Errors returned here mean the delivery must NOT be acknowledged
    /// (signature failures). Everything after successful authentication
    /// resolves to `Ok`; processing failures are recorded on the event row
    /// and left to gateway redelivery plus claim recovery.
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<()> {
        let envelope = self.gateway.verify_event(payload, signature)?;

        let event_timestamp = OffsetDateTime::from_unix_timestamp(envelope.created_unix)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let claimed = self
            .store
            .claim_event(&envelope.event_id, &envelope.event_type, event_timestamp)
            .await?;
        if !claimed {
            tracing::info!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "Duplicate webhook delivery, already claimed"
            );
            return Ok(());
        }

        match self.dispatch(&envelope).await {
            Ok(()) => {
                // The state change is already committed; a lost bookkeeping
                // write must not turn an accepted delivery into an error
                // response. Redelivery lands on the claim table.
                if let Err(e) = self
                    .store
                    .finish_event(&envelope.event_id, true, None)
                    .await
                {
                    tracing::error!(
                        event_id = %envelope.event_id,
                        error = %e,
                        "Failed to record webhook completion"
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Webhook processing failed"
                );
                self.store
                    .finish_event(&envelope.event_id, false, Some(&e.to_string()))
                    .await?;
            }
        }

        Ok(())
    }

    async fn dispatch(&self, envelope: &EventEnvelope) -> BillingResult<()> {
        let class = EventClass::classify(&envelope.event_type, &envelope.object);
        tracing::debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            class = ?class,
            "Dispatching webhook event"
        );

        match class {
            EventClass::CheckoutCompleted { session_id } => {
                self.activation.activate_session(&session_id).await?;
                Ok(())
            }
            EventClass::CheckoutExpired { session_id } => {
                let cleaned = self
                    .store
                    .mark_session_payment_failed(&session_id, "checkout session expired")
                    .await?;
                if cleaned {
                    tracing::info!(
                        session_id = %session_id,
                        "Marked expired checkout session payment failed"
                    );
                }
                Ok(())
            }
            EventClass::RenewalSucceeded {
                subscription_ref,
                txn_ref,
            } => {
                self.activation.renew(&subscription_ref, &txn_ref).await?;
                Ok(())
            }
            EventClass::RenewalFailed {
                subscription_ref,
                failure_reason,
            } => {
                self.activation
                    .renewal_failed(&subscription_ref, &failure_reason)
                    .await
            }
            EventClass::Canceled { subscription_ref } => {
                self.activation.cancel(&subscription_ref).await
            }
            EventClass::PriceChanged { price_ref } => {
                let report = self.sync.sync_price(&price_ref).await?;
                if !report.errors.is_empty() {
                    return Err(BillingError::Gateway(format!(
                        "price sync finished with {} errors",
                        report.errors.len()
                    )));
                }
                Ok(())
            }
            EventClass::ProductChanged { product_ref } => {
                let report = self.sync.sync_product(&product_ref).await?;
                if !report.errors.is_empty() {
                    return Err(BillingError::Gateway(format!(
                        "product sync finished with {} errors",
                        report.errors.len()
                    )));
                }
                Ok(())
            }
            EventClass::Ignored => {
                tracing::debug!(
                    event_type = %envelope.event_type,
                    "Ignoring unhandled event type"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_checkout_completed() {
        let object = json!({"id": "cs_test_1", "mode": "subscription"});
        assert_eq!(
            EventClass::classify("checkout.session.completed", &object),
            EventClass::CheckoutCompleted {
                session_id: "cs_test_1".into()
            }
        );
    }

    #[test]
    fn test_classify_renewal_with_string_subscription() {
        let object = json!({
            "id": "in_1",
            "billing_reason": "subscription_cycle",
            "subscription": "sub_123",
            "payment_intent": "pi_456"
        });
        assert_eq!(
            EventClass::classify("invoice.paid", &object),
            EventClass::RenewalSucceeded {
                subscription_ref: "sub_123".into(),
                txn_ref: "pi_456".into()
            }
        );
    }

    #[test]
    fn test_classify_renewal_with_expanded_refs() {
        let object = json!({
            "id": "in_1",
            "billing_reason": "subscription_cycle",
            "subscription": {"id": "sub_123"},
            "payment_intent": {"id": "pi_456"}
        });
        assert_eq!(
            EventClass::classify("invoice.paid", &object),
            EventClass::RenewalSucceeded {
                subscription_ref: "sub_123".into(),
                txn_ref: "pi_456".into()
            }
        );
    }

    #[test]
    fn test_classify_renewal_falls_back_to_line_items() {
        let object = json!({
            "id": "in_1",
            "billing_reason": "subscription_cycle",
            "payment_intent": "pi_456",
            "lines": {"data": [{"subscription": "sub_123"}]}
        });
        assert_eq!(
            EventClass::classify("invoice.paid", &object),
            EventClass::RenewalSucceeded {
                subscription_ref: "sub_123".into(),
                txn_ref: "pi_456".into()
            }
        );
    }

    #[test]
    fn test_initial_invoice_is_ignored() {
        let object = json!({
            "id": "in_1",
            "billing_reason": "subscription_create",
            "subscription": "sub_123",
            "payment_intent": "pi_456"
        });
        assert_eq!(
            EventClass::classify("invoice.paid", &object),
            EventClass::Ignored
        );
    }

    #[test]
    fn test_classify_payment_failed_extracts_reason() {
        let object = json!({
            "id": "in_1",
            "subscription": "sub_123",
            "last_payment_error": {"message": "card declined"}
        });
        assert_eq!(
            EventClass::classify("invoice.payment_failed", &object),
            EventClass::RenewalFailed {
                subscription_ref: "sub_123".into(),
                failure_reason: "card declined".into()
            }
        );
    }

    #[test]
    fn test_classify_subscription_deleted() {
        let object = json!({"id": "sub_123"});
        assert_eq!(
            EventClass::classify("customer.subscription.deleted", &object),
            EventClass::Canceled {
                subscription_ref: "sub_123".into()
            }
        );
    }

    #[test]
    fn test_unknown_event_type_ignored() {
        let object = json!({"id": "x"});
        assert_eq!(
            EventClass::classify("customer.tax_id.created", &object),
            EventClass::Ignored
        );
    }
}
