//! Payment-gateway connector for Stripe-style webhooks.
//!
//! Signatures arrive as `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>]`
//! and cover `"{t}.{body}"`. Natural keys use the provider object id of the
//! fact: the payment id for settlement (so `charge.succeeded` and
//! `payment_intent.succeeded` for one payment collapse), the charge id for
//! a failed attempt, the refund id for refunds and the payout id for
//! payouts. Settlements and failures carry the charge in `charge_id`, so a
//! declined charge followed by a successful retry stays two attempts of one
//! payment.

use super::signature::{hmac_sha256, verify_hmac_sha256};
use super::{
    Connector, ProviderKey, SetupConfig, SetupField, parse_json, required_i64, required_str,
};
use crate::domain::canonical::{CanonicalEvent, EventKind, NaturalKey};
use crate::domain::money::MinorUnits;
use crate::domain::raw_event::{HeaderMapping, RawEvent, WebhookEnvelope};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

const SUBSCRIBED_EVENTS: [&str; 7] = [
    "payment_intent.succeeded",
    "payment_intent.payment_failed",
    "charge.succeeded",
    "charge.failed",
    "charge.refunded",
    "refund.created",
    "payout.paid",
];

#[derive(Debug, Clone)]
pub struct StripeConnector {
    tolerance: Option<Duration>,
}

impl Default for StripeConnector {
    fn default() -> Self {
        Self {
            tolerance: Some(Duration::seconds(DEFAULT_TOLERANCE_SECS)),
        }
    }
}

impl StripeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` disables the timestamp freshness check.
    pub fn with_tolerance(tolerance: Option<Duration>) -> Self {
        Self { tolerance }
    }
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    fn parse(value: &str) -> Option<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in value.split(',') {
            let (key, val) = part.trim().split_once('=')?;
            match key {
                "t" => timestamp = val.parse::<i64>().ok(),
                "v1" => {
                    if let Ok(sig) = hex::decode(val) {
                        signatures.push(sig);
                    }
                }
                _ => {}
            }
        }
        let timestamp = timestamp?;
        if signatures.is_empty() {
            return None;
        }
        Some(Self {
            timestamp,
            signatures,
        })
    }
}

fn signed_payload(timestamp: i64, body: &[u8]) -> Vec<u8> {
    let prefix = format!("{timestamp}.");
    let mut payload = Vec::with_capacity(prefix.len() + body.len());
    payload.extend_from_slice(prefix.as_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Builds a `Stripe-Signature` header value for `body`. Used by provider
/// sync tooling and tests that need to produce valid deliveries.
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let tag = hmac_sha256(secret.as_bytes(), &signed_payload(timestamp, body));
    format!("t={timestamp},v1={}", hex::encode(tag))
}

impl Connector for StripeConnector {
    fn provider(&self) -> ProviderKey {
        ProviderKey::Stripe
    }

    fn verify_signature(&self, body: &[u8], headers: &HeaderMapping, secret: &str) -> bool {
        if secret.is_empty() {
            return false;
        }
        let Some(header) = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| SignatureHeader::parse(v))
        else {
            return false;
        };
        if let Some(tolerance) = self.tolerance {
            let age = Utc::now().timestamp() - header.timestamp;
            if age.abs() > tolerance.num_seconds() {
                return false;
            }
        }
        let payload = signed_payload(header.timestamp, body);
        header
            .signatures
            .iter()
            .any(|sig| verify_hmac_sha256(secret.as_bytes(), &payload, sig))
    }

    fn parse_webhook(&self, envelope: WebhookEnvelope) -> Result<RawEvent> {
        let value = parse_json(&envelope.body)?;
        required_str(&value, "id")?;
        let event_type = required_str(&value, "type")?.to_string();
        Ok(RawEvent::from_envelope(
            ProviderKey::Stripe.as_str(),
            event_type,
            envelope,
        ))
    }

    fn normalize(&self, raw: &RawEvent) -> Result<Vec<CanonicalEvent>> {
        if !SUBSCRIBED_EVENTS.contains(&raw.event_type.as_str()) {
            return Ok(Vec::new());
        }
        let value = parse_json(&raw.body)?;
        let occurred_at = timestamp(required_i64(&value, "created")?)?;
        let object = value
            .get("data")
            .and_then(|d| d.get("object"))
            .ok_or_else(|| PaymentError::MalformedPayload("missing data.object".into()))?;
        let builder = EventBuilder { raw, occurred_at };

        match raw.event_type.as_str() {
            "payment_intent.succeeded" | "charge.succeeded" => {
                let entity_id = payment_id(object)?;
                let amount = object
                    .get("amount_received")
                    .and_then(Value::as_i64)
                    .map(Ok)
                    .unwrap_or_else(|| required_i64(object, "amount"))?;
                let mut details = json!({ "charge_id": attempt_id(object, entity_id) });
                if let Some(order_id) = metadata_str(object, "order_id") {
                    details["order_id"] = json!(order_id);
                }
                Ok(vec![builder.build(
                    EventKind::PaymentSettled,
                    entity_id,
                    entity_id,
                    amount,
                    currency(object)?,
                    details,
                )])
            }
            "payment_intent.payment_failed" | "charge.failed" => {
                let entity_id = payment_id(object)?;
                let charge_id = attempt_id(object, entity_id);
                let amount = required_i64(object, "amount")?;
                let reason = object
                    .get("last_payment_error")
                    .and_then(|e| e.get("message"))
                    .or_else(|| object.get("failure_message"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(vec![builder.build(
                    EventKind::PaymentFailed,
                    entity_id,
                    charge_id,
                    amount,
                    currency(object)?,
                    json!({ "reason": reason, "charge_id": charge_id }),
                )])
            }
            "charge.refunded" => {
                let entity_id = payment_id(object)?;
                let currency = currency(object)?;
                let refunds = object
                    .get("refunds")
                    .and_then(|r| r.get("data"))
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        PaymentError::MalformedPayload("charge.refunded without refunds".into())
                    })?;
                refunds
                    .iter()
                    .map(|refund| {
                        let refund_id = required_str(refund, "id")?;
                        let amount = required_i64(refund, "amount")?;
                        Ok(builder.build(
                            EventKind::PaymentRefunded,
                            entity_id,
                            refund_id,
                            amount,
                            currency.clone(),
                            json!({ "refund_id": refund_id }),
                        ))
                    })
                    .collect()
            }
            "refund.created" => {
                let refund_id = required_str(object, "id")?;
                let entity_id = object
                    .get("payment_intent")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(Ok)
                    .unwrap_or_else(|| required_str(object, "charge"))?;
                let amount = required_i64(object, "amount")?;
                Ok(vec![builder.build(
                    EventKind::PaymentRefunded,
                    entity_id,
                    refund_id,
                    amount,
                    currency(object)?,
                    json!({ "refund_id": refund_id }),
                )])
            }
            "payout.paid" => {
                let payout_id = required_str(object, "id")?;
                let amount = required_i64(object, "amount")?;
                let payment_ids: Vec<&str> = metadata_str(object, "payment_ids")
                    .map(|ids| {
                        ids.split(',')
                            .map(str::trim)
                            .filter(|id| !id.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(vec![builder.build(
                    EventKind::PayoutIssued,
                    payout_id,
                    payout_id,
                    amount,
                    currency(object)?,
                    json!({ "payment_ids": payment_ids }),
                )])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn setup_config(&self, project_id: &str) -> SetupConfig {
        SetupConfig {
            provider: ProviderKey::Stripe,
            project_id: project_id.to_string(),
            webhook_path: "/webhooks/stripe?key={webhook_key}".to_string(),
            signature_header: "Stripe-Signature",
            subscribed_events: SUBSCRIBED_EVENTS.to_vec(),
            fields: vec![
                SetupField {
                    name: "signing_secret",
                    description: "Endpoint signing secret (whsec_...) from the webhook settings",
                    secret: true,
                },
                SetupField {
                    name: "metadata.order_id",
                    description: "Optional payment metadata linking a payment to its order",
                    secret: false,
                },
            ],
        }
    }
}

struct EventBuilder<'a> {
    raw: &'a RawEvent,
    occurred_at: DateTime<Utc>,
}

impl EventBuilder<'_> {
    fn build(
        &self,
        kind: EventKind,
        entity_id: &str,
        object_id: &str,
        amount: i64,
        currency: String,
        details: Value,
    ) -> CanonicalEvent {
        CanonicalEvent {
            provider: ProviderKey::Stripe.as_str().to_string(),
            kind,
            natural_key: NaturalKey::from_object(ProviderKey::Stripe.as_str(), kind, object_id),
            org_id: self.raw.org_id.clone(),
            project_id: Some(self.raw.project_id.clone()),
            entity_id: entity_id.to_string(),
            amount: MinorUnits::new(amount),
            currency,
            occurred_at: self.occurred_at,
            details,
        }
    }
}

/// Charges roll up to their payment intent when they have one.
fn payment_id(object: &Value) -> Result<&str> {
    let is_charge = object.get("object").and_then(Value::as_str) == Some("charge");
    match object.get("payment_intent").and_then(Value::as_str) {
        Some(pi) if is_charge && !pi.is_empty() => Ok(pi),
        _ => required_str(object, "id"),
    }
}

/// The charge a settlement or failure concerns. Payment intents name it in
/// `last_payment_error.charge` or `latest_charge`; without either the payment
/// itself stands for the attempt.
fn attempt_id<'a>(object: &'a Value, payment_id: &'a str) -> &'a str {
    let charge = if object.get("object").and_then(Value::as_str) == Some("charge") {
        object.get("id")
    } else {
        object
            .get("last_payment_error")
            .and_then(|e| e.get("charge"))
            .or_else(|| object.get("latest_charge"))
    };
    charge
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(payment_id)
}

fn currency(object: &Value) -> Result<String> {
    Ok(required_str(object, "currency")?.to_ascii_uppercase())
}

fn metadata_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object
        .get("metadata")
        .and_then(|m| m.get(field))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PaymentError::MalformedPayload(format!("invalid timestamp {secs}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn envelope(body: &[u8]) -> WebhookEnvelope {
        WebhookEnvelope::new("org_1", "proj_1", HeaderMapping::new(), body.to_vec(), Utc::now())
    }

    fn settled_body(id: &str, amount: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1_767_268_800,
            "data": { "object": {
                "id": id,
                "object": "payment_intent",
                "amount": amount,
                "amount_received": amount,
                "currency": "usd",
                "metadata": { "order_id": "ord_1" }
            }}
        }))
        .unwrap()
    }

    fn headers_for(body: &[u8], timestamp: i64) -> HeaderMapping {
        let mut headers = HeaderMapping::new();
        headers.insert(
            SIGNATURE_HEADER.to_string(),
            signature_header(SECRET, timestamp, body),
        );
        headers
    }

    #[test]
    fn test_verify_signature_accepts_valid_and_rejects_tampered() {
        let connector = StripeConnector::new();
        let body = settled_body("p_123", 10000);
        let headers = headers_for(&body, Utc::now().timestamp());

        assert!(connector.verify_signature(&body, &headers, SECRET));
        assert!(!connector.verify_signature(b"{\"tampered\":true}", &headers, SECRET));
        assert!(!connector.verify_signature(&body, &headers, "whsec_other"));
        assert!(!connector.verify_signature(&body, &HeaderMapping::new(), SECRET));
    }

    #[test]
    fn test_verify_signature_enforces_tolerance() {
        let body = settled_body("p_123", 10000);
        let stale = Utc::now().timestamp() - DEFAULT_TOLERANCE_SECS - 60;
        let headers = headers_for(&body, stale);

        assert!(!StripeConnector::new().verify_signature(&body, &headers, SECRET));
        assert!(StripeConnector::with_tolerance(None).verify_signature(&body, &headers, SECRET));
    }

    #[test]
    fn test_normalize_payment_settled() {
        let connector = StripeConnector::new();
        let raw = connector
            .parse_webhook(envelope(&settled_body("p_123", 10000)))
            .unwrap();
        assert_eq!(raw.event_type, "payment_intent.succeeded");

        let events = connector.normalize(&raw).unwrap();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.kind, EventKind::PaymentSettled);
        assert_eq!(ev.amount, MinorUnits::new(10000));
        assert_eq!(ev.currency, "USD");
        assert_eq!(ev.natural_key.as_str(), "stripe:payment-settled:p_123");
        assert_eq!(ev.detail_str("order_id"), Some("ord_1"));
        assert_eq!(ev.org_id, "org_1");

        // Deterministic across re-processing.
        assert_eq!(connector.normalize(&raw).unwrap(), events);
    }

    fn charge_body(event_type: &str, charge: &str, created: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": format!("evt_{charge}"),
            "type": event_type,
            "created": created,
            "data": { "object": {
                "id": charge,
                "object": "charge",
                "payment_intent": "pi_1",
                "amount": 10000,
                "currency": "usd",
                "failure_message": "card declined"
            }}
        }))
        .unwrap()
    }

    #[test]
    fn test_declined_charge_then_retry_settles_the_payment() {
        use crate::domain::ledger::{ApplyOutcome, PaymentStatus, apply_event};

        let connector = StripeConnector::new();
        let normalize = |body: Vec<u8>| {
            let raw = connector.parse_webhook(envelope(&body)).unwrap();
            connector.normalize(&raw).unwrap().remove(0)
        };
        let failed = normalize(charge_body("charge.failed", "ch_1", 1_767_268_800));
        let settled = normalize(charge_body("charge.succeeded", "ch_2", 1_767_268_860));

        assert_eq!(failed.entity_id, "pi_1");
        assert_eq!(failed.natural_key.as_str(), "stripe:payment-failed:ch_1");
        assert_eq!(failed.detail_str("charge_id"), Some("ch_1"));
        assert_eq!(settled.natural_key.as_str(), "stripe:payment-settled:pi_1");
        assert_eq!(settled.detail_str("charge_id"), Some("ch_2"));

        let (entity, _) = apply_event(None, &failed).unwrap();
        let (entity, outcome) = apply_event(Some(entity), &settled).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(entity.as_payment().unwrap().status(), PaymentStatus::Settled);
    }

    #[test]
    fn test_intent_failure_is_keyed_by_its_charge() {
        let connector = StripeConnector::new();
        let body = serde_json::to_vec(&json!({
            "id": "evt_5",
            "type": "payment_intent.payment_failed",
            "created": 1_767_268_800,
            "data": { "object": {
                "id": "pi_1",
                "object": "payment_intent",
                "amount": 10000,
                "currency": "usd",
                "last_payment_error": { "charge": "ch_1", "message": "card declined" }
            }}
        }))
        .unwrap();
        let raw = connector.parse_webhook(envelope(&body)).unwrap();
        let events = connector.normalize(&raw).unwrap();
        assert_eq!(events[0].natural_key.as_str(), "stripe:payment-failed:ch_1");
        assert_eq!(events[0].details["reason"], "card declined");
    }

    #[test]
    fn test_charge_refunded_emits_one_event_per_refund() {
        let connector = StripeConnector::new();
        let body = serde_json::to_vec(&json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "created": 1_767_268_800,
            "data": { "object": {
                "id": "ch_1",
                "object": "charge",
                "payment_intent": "pi_1",
                "currency": "eur",
                "refunds": { "data": [
                    { "id": "re_1", "amount": 300 },
                    { "id": "re_2", "amount": 200 }
                ]}
            }}
        }))
        .unwrap();
        let raw = connector.parse_webhook(envelope(&body)).unwrap();
        let events = connector.normalize(&raw).unwrap();

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.entity_id == "pi_1"));
        assert_eq!(events[0].natural_key.as_str(), "stripe:payment-refunded:re_1");
        assert_eq!(events[1].amount, MinorUnits::new(200));
    }

    #[test]
    fn test_payout_collects_payment_ids() {
        let connector = StripeConnector::new();
        let body = serde_json::to_vec(&json!({
            "id": "evt_3",
            "type": "payout.paid",
            "created": 1_767_268_800,
            "data": { "object": {
                "id": "po_1",
                "amount": 1500,
                "currency": "usd",
                "metadata": { "payment_ids": "pi_1, pi_2" }
            }}
        }))
        .unwrap();
        let raw = connector.parse_webhook(envelope(&body)).unwrap();
        let events = connector.normalize(&raw).unwrap();

        assert_eq!(events[0].kind, EventKind::PayoutIssued);
        assert_eq!(events[0].details["payment_ids"], json!(["pi_1", "pi_2"]));
    }

    #[test]
    fn test_unknown_event_type_yields_nothing() {
        let connector = StripeConnector::new();
        let body = br#"{"id":"evt_4","type":"customer.created","created":1,"data":{"object":{}}}"#;
        let raw = connector.parse_webhook(envelope(body)).unwrap();
        assert!(connector.normalize(&raw).unwrap().is_empty());
    }

    #[test]
    fn test_parse_webhook_rejects_garbage() {
        let connector = StripeConnector::new();
        assert!(matches!(
            connector.parse_webhook(envelope(b"not json")),
            Err(PaymentError::MalformedPayload(_))
        ));
        assert!(matches!(
            connector.parse_webhook(envelope(b"{\"id\":\"evt\"}")),
            Err(PaymentError::MalformedPayload(_))
        ));
    }
}
