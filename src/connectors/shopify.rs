//! Checkout-platform connector for Shopify-style webhooks.
//!
//! The signature is `X-Shopify-Hmac-Sha256: base64(HMAC-SHA256(secret, body))`
//! and the event type travels in `X-Shopify-Topic`. Amounts are decimal
//! strings in major units.
//!
//! Natural keys: orders and order payments are keyed by the order id,
//! refunds by the refund id. A refund delivered without an id is keyed by
//! the SHA-256 of the delivered bytes, so only a byte-identical redelivery
//! collapses with it.

use super::signature::{hmac_sha256, verify_hmac_sha256};
use super::{Connector, ProviderKey, SetupConfig, SetupField, parse_json};
use crate::domain::canonical::{CanonicalEvent, EventKind, NaturalKey};
use crate::domain::money::MinorUnits;
use crate::domain::raw_event::{HeaderMapping, RawEvent, WebhookEnvelope};
use crate::error::{PaymentError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

pub const HMAC_HEADER: &str = "x-shopify-hmac-sha256";
pub const TOPIC_HEADER: &str = "x-shopify-topic";

const TOPICS: [&str; 4] = [
    "orders/create",
    "orders/cancelled",
    "orders/paid",
    "refunds/create",
];

#[derive(Debug, Clone, Default)]
pub struct ShopifyConnector;

impl ShopifyConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Builds an `X-Shopify-Hmac-Sha256` header value for `body`.
pub fn signature_header(secret: &str, body: &[u8]) -> String {
    STANDARD.encode(hmac_sha256(secret.as_bytes(), body))
}

impl Connector for ShopifyConnector {
    fn provider(&self) -> ProviderKey {
        ProviderKey::Shopify
    }

    fn verify_signature(&self, body: &[u8], headers: &HeaderMapping, secret: &str) -> bool {
        if secret.is_empty() {
            return false;
        }
        let Some(tag) = headers
            .get(HMAC_HEADER)
            .and_then(|v| STANDARD.decode(v.trim()).ok())
        else {
            return false;
        };
        verify_hmac_sha256(secret.as_bytes(), body, &tag)
    }

    fn parse_webhook(&self, envelope: WebhookEnvelope) -> Result<RawEvent> {
        let topic = envelope
            .headers
            .get(TOPIC_HEADER)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PaymentError::MalformedPayload(format!("missing {TOPIC_HEADER}")))?;
        if !parse_json(&envelope.body)?.is_object() {
            return Err(PaymentError::MalformedPayload(
                "webhook body is not a JSON object".into(),
            ));
        }
        Ok(RawEvent::from_envelope(
            ProviderKey::Shopify.as_str(),
            topic,
            envelope,
        ))
    }

    fn normalize(&self, raw: &RawEvent) -> Result<Vec<CanonicalEvent>> {
        if !TOPICS.contains(&raw.event_type.as_str()) {
            return Ok(Vec::new());
        }
        let value = parse_json(&raw.body)?;

        match raw.event_type.as_str() {
            "orders/create" => {
                let order_id = required_id(&value, "id")?;
                let currency = currency(&value)?;
                let amount = major_amount(&value, "total_price", &currency)?;
                Ok(vec![event(
                    raw,
                    EventKind::OrderCreated,
                    NaturalKey::from_object("shopify", EventKind::OrderCreated, &order_id),
                    order_id,
                    amount,
                    currency,
                    required_time(&value, "created_at")?,
                    json!({ "name": value.get("name").cloned().unwrap_or(Value::Null) }),
                )])
            }
            "orders/cancelled" => {
                let order_id = required_id(&value, "id")?;
                let currency = currency(&value)?;
                let amount = major_amount(&value, "total_price", &currency)?;
                let occurred_at = optional_time(&value, "cancelled_at")?
                    .map(Ok)
                    .unwrap_or_else(|| required_time(&value, "updated_at"))?;
                Ok(vec![event(
                    raw,
                    EventKind::OrderCancelled,
                    NaturalKey::from_object("shopify", EventKind::OrderCancelled, &order_id),
                    order_id,
                    amount,
                    currency,
                    occurred_at,
                    json!({ "reason": value.get("cancel_reason").cloned().unwrap_or(Value::Null) }),
                )])
            }
            "orders/paid" => {
                let order_id = required_id(&value, "id")?;
                let currency = currency(&value)?;
                let amount = major_amount(&value, "total_price", &currency)?;
                let occurred_at = optional_time(&value, "processed_at")?
                    .map(Ok)
                    .unwrap_or_else(|| required_time(&value, "updated_at"))?;
                Ok(vec![event(
                    raw,
                    EventKind::PaymentSettled,
                    NaturalKey::from_object("shopify", EventKind::PaymentSettled, &order_id),
                    order_id.clone(),
                    amount,
                    currency,
                    occurred_at,
                    json!({ "order_id": order_id }),
                )])
            }
            "refunds/create" => {
                let order_id = required_id(&value, "order_id")?;
                let natural_key = match optional_id(&value, "id") {
                    Some(refund_id) => {
                        NaturalKey::from_object("shopify", EventKind::PaymentRefunded, &refund_id)
                    }
                    None => NaturalKey::from_content("shopify", EventKind::PaymentRefunded, &raw.body),
                };
                let transactions = value
                    .get("transactions")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let mut currency_code = None;
                let mut amount = MinorUnits::ZERO;
                for tx in transactions
                    .iter()
                    .filter(|tx| tx.get("kind").and_then(Value::as_str) == Some("refund"))
                {
                    let code = currency(tx)?;
                    amount += major_amount(tx, "amount", &code)?;
                    currency_code.get_or_insert(code);
                }
                let Some(currency_code) = currency_code else {
                    return Ok(Vec::new());
                };
                Ok(vec![event(
                    raw,
                    EventKind::PaymentRefunded,
                    natural_key,
                    order_id.clone(),
                    amount,
                    currency_code,
                    required_time(&value, "created_at")?,
                    json!({ "order_id": order_id }),
                )])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn setup_config(&self, project_id: &str) -> SetupConfig {
        SetupConfig {
            provider: ProviderKey::Shopify,
            project_id: project_id.to_string(),
            webhook_path: "/webhooks/shopify?key={webhook_key}".to_string(),
            signature_header: "X-Shopify-Hmac-Sha256",
            subscribed_events: TOPICS.to_vec(),
            fields: vec![
                SetupField {
                    name: "signing_secret",
                    description: "App client secret used to sign webhook deliveries",
                    secret: true,
                },
                SetupField {
                    name: "shop_domain",
                    description: "The *.myshopify.com domain the app is installed on",
                    secret: false,
                },
            ],
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn event(
    raw: &RawEvent,
    kind: EventKind,
    natural_key: NaturalKey,
    entity_id: String,
    amount: MinorUnits,
    currency: String,
    occurred_at: DateTime<Utc>,
    details: Value,
) -> CanonicalEvent {
    CanonicalEvent {
        provider: ProviderKey::Shopify.as_str().to_string(),
        kind,
        natural_key,
        org_id: raw.org_id.clone(),
        project_id: Some(raw.project_id.clone()),
        entity_id,
        amount,
        currency,
        occurred_at,
        details,
    }
}

/// Ids are JSON numbers in most payloads and strings in a few.
fn optional_id(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn required_id(value: &Value, field: &str) -> Result<String> {
    optional_id(value, field)
        .ok_or_else(|| PaymentError::MalformedPayload(format!("missing id field '{field}'")))
}

fn currency(value: &Value) -> Result<String> {
    value
        .get("currency")
        .and_then(Value::as_str)
        .filter(|c| !c.trim().is_empty())
        .map(|c| c.trim().to_ascii_uppercase())
        .ok_or_else(|| PaymentError::MalformedPayload("missing currency".into()))
}

fn major_amount(value: &Value, field: &str, currency: &str) -> Result<MinorUnits> {
    let amount = value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| PaymentError::MalformedPayload(format!("missing amount field '{field}'")))?;
    MinorUnits::parse_major(amount, currency)
}

fn optional_time(value: &Value, field: &str) -> Result<Option<DateTime<Utc>>> {
    match value.get(field).and_then(Value::as_str) {
        Some(ts) => DateTime::parse_from_rfc3339(ts)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| PaymentError::MalformedPayload(format!("invalid {field} '{ts}': {e}"))),
        None => Ok(None),
    }
}

fn required_time(value: &Value, field: &str) -> Result<DateTime<Utc>> {
    optional_time(value, field)?
        .ok_or_else(|| PaymentError::MalformedPayload(format!("missing timestamp '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "shpss_test";

    fn raw(topic: &str, body: Value) -> RawEvent {
        let mut headers = HeaderMapping::new();
        headers.insert(TOPIC_HEADER.to_string(), topic.to_string());
        let envelope = WebhookEnvelope::new(
            "org_1",
            "proj_1",
            headers,
            serde_json::to_vec(&body).unwrap(),
            Utc::now(),
        );
        ShopifyConnector::new().parse_webhook(envelope).unwrap()
    }

    #[test]
    fn test_verify_signature() {
        let connector = ShopifyConnector::new();
        let body = br#"{"id":1}"#;
        let mut headers = HeaderMapping::new();
        headers.insert(HMAC_HEADER.to_string(), signature_header(SECRET, body));

        assert!(connector.verify_signature(body, &headers, SECRET));
        assert!(!connector.verify_signature(br#"{"id":2}"#, &headers, SECRET));
        assert!(!connector.verify_signature(body, &headers, ""));

        headers.insert(HMAC_HEADER.to_string(), "not base64!".to_string());
        assert!(!connector.verify_signature(body, &headers, SECRET));
    }

    #[test]
    fn test_order_created_converts_major_units() {
        let raw = raw(
            "orders/create",
            json!({
                "id": 450789469,
                "name": "#1001",
                "total_price": "199.99",
                "currency": "USD",
                "created_at": "2026-01-01T07:00:00-05:00"
            }),
        );
        let events = ShopifyConnector::new().normalize(&raw).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::OrderCreated);
        assert_eq!(events[0].entity_id, "450789469");
        assert_eq!(events[0].amount, MinorUnits::new(19999));
        assert_eq!(
            events[0].occurred_at,
            "2026-01-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_refund_without_id_uses_content_hash() {
        let body = json!({
            "order_id": 450789469,
            "created_at": "2026-01-02T00:00:00Z",
            "transactions": [
                { "kind": "refund", "amount": "10.00", "currency": "USD" },
                { "kind": "sale", "amount": "99.00", "currency": "USD" }
            ]
        });
        let connector = ShopifyConnector::new();
        let first = connector.normalize(&raw("refunds/create", body.clone())).unwrap();
        let second = connector.normalize(&raw("refunds/create", body)).unwrap();

        assert_eq!(first[0].amount, MinorUnits::new(1000));
        assert!(first[0].natural_key.as_str().starts_with("shopify:payment-refunded:sha256:"));
        assert_eq!(first[0].natural_key, second[0].natural_key);
    }

    #[test]
    fn test_parse_requires_topic_header() {
        let envelope = WebhookEnvelope::new(
            "org_1",
            "proj_1",
            HeaderMapping::new(),
            b"{}".to_vec(),
            Utc::now(),
        );
        assert!(matches!(
            ShopifyConnector::new().parse_webhook(envelope),
            Err(PaymentError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_unhandled_topic_is_empty() {
        let raw = raw("customers/create", json!({ "id": 1 }));
        assert!(ShopifyConnector::new().normalize(&raw).unwrap().is_empty());
    }
}
