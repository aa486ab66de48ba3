//! Provider connectors: one adapter per external provider, each turning raw
//! webhook bytes into canonical events.
//!
//! Connectors are stateless after construction and never perform I/O, so a
//! single instance is shared by every request and job.

pub mod registry;
pub mod shopify;
pub mod signature;
pub mod stripe;

use crate::domain::canonical::CanonicalEvent;
use crate::domain::raw_event::{HeaderMapping, RawEvent, WebhookEnvelope};
use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use registry::ConnectorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKey {
    Stripe,
    Shopify,
}

impl ProviderKey {
    pub const ALL: [ProviderKey; 2] = [ProviderKey::Stripe, ProviderKey::Shopify];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKey::Stripe => "stripe",
            ProviderKey::Shopify => "shopify",
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKey {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stripe" => Ok(ProviderKey::Stripe),
            "shopify" => Ok(ProviderKey::Shopify),
            other => Err(PaymentError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupField {
    pub name: &'static str,
    pub description: &'static str,
    pub secret: bool,
}

/// What an operator must provision for a project to receive webhooks from
/// a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupConfig {
    pub provider: ProviderKey,
    pub project_id: String,
    pub webhook_path: String,
    pub signature_header: &'static str,
    pub subscribed_events: Vec<&'static str>,
    pub fields: Vec<SetupField>,
}

pub trait Connector: Send + Sync {
    fn provider(&self) -> ProviderKey;

    /// Constant-time check of the provider's signature over `body`.
    fn verify_signature(&self, body: &[u8], headers: &HeaderMapping, secret: &str) -> bool;

    /// Extracts the event type from a verified delivery. Pure.
    fn parse_webhook(&self, envelope: WebhookEnvelope) -> Result<RawEvent>;

    /// Deterministic mapping from a raw event to canonical events. Payload
    /// types the connector does not handle produce an empty vector.
    fn normalize(&self, raw: &RawEvent) -> Result<Vec<CanonicalEvent>>;

    fn setup_config(&self, project_id: &str) -> SetupConfig;
}

/// Parses a delivery body as JSON, mapping failures to `MalformedPayload`.
pub(crate) fn parse_json(body: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(body)
        .map_err(|e| PaymentError::MalformedPayload(format!("invalid json body: {e}")))
}

pub(crate) fn required_str<'a>(value: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PaymentError::MalformedPayload(format!("missing field '{field}'")))
}

pub(crate) fn required_i64(value: &serde_json::Value, field: &str) -> Result<i64> {
    value
        .get(field)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| PaymentError::MalformedPayload(format!("missing integer field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_key_parsing() {
        assert_eq!("Stripe".parse::<ProviderKey>().unwrap(), ProviderKey::Stripe);
        assert_eq!(" shopify ".parse::<ProviderKey>().unwrap(), ProviderKey::Shopify);
        assert!(matches!(
            "paypal".parse::<ProviderKey>(),
            Err(PaymentError::UnknownProvider(_))
        ));
    }
}
