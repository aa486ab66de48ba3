//! Provider-agnostic vocabulary shared by connectors and the ledger.
//!
//! Connectors emit [`CanonicalEvent`]s; nothing downstream of normalization
//! ever looks at a provider payload again.

use super::money::MinorUnits;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PaymentSettled,
    PaymentRefunded,
    PaymentFailed,
    OrderCreated,
    OrderCancelled,
    PayoutIssued,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::PaymentSettled,
        EventKind::PaymentRefunded,
        EventKind::PaymentFailed,
        EventKind::OrderCreated,
        EventKind::OrderCancelled,
        EventKind::PayoutIssued,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PaymentSettled => "payment-settled",
            EventKind::PaymentRefunded => "payment-refunded",
            EventKind::PaymentFailed => "payment-failed",
            EventKind::OrderCreated => "order-created",
            EventKind::OrderCancelled => "order-cancelled",
            EventKind::PayoutIssued => "payout-issued",
        }
    }

    /// The kind of ledger entity an event of this kind mutates.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            EventKind::PaymentSettled | EventKind::PaymentRefunded | EventKind::PaymentFailed => {
                EntityKind::Payment
            }
            EventKind::OrderCreated | EventKind::OrderCancelled => EntityKind::Order,
            EventKind::PayoutIssued => EntityKind::Payout,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Payment,
    Order,
    Payout,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Payment => "payment",
            EntityKind::Order => "order",
            EntityKind::Payout => "payout",
        }
    }
}

/// Reference to a ledger entity: `payment:stripe:pi_123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub provider: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind.as_str(), self.provider, self.id)
    }
}

/// Deduplication identity of a canonical event.
///
/// Two events with the same natural key describe the same real-world fact
/// and collapse to a single applied effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Key for a fact identified by a stable provider object id.
    pub fn from_object(provider: &str, kind: EventKind, object_id: &str) -> Self {
        Self(format!("{provider}:{}:{object_id}", kind.as_str()))
    }

    /// Key for a fact whose payload carries no stable id: the SHA-256 of the
    /// exact bytes the provider delivered.
    pub fn from_content(provider: &str, kind: EventKind, content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Self(format!(
            "{provider}:{}:sha256:{}",
            kind.as_str(),
            hex::encode(digest)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<String> for NaturalKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub provider: String,
    pub kind: EventKind,
    pub natural_key: NaturalKey,
    pub org_id: String,
    pub project_id: Option<String>,
    /// Provider object id of the ledger entity this fact is about.
    pub entity_id: String,
    pub amount: MinorUnits,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl CanonicalEvent {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(
            self.kind.entity_kind(),
            self.provider.clone(),
            self.entity_id.clone(),
        )
    }

    /// Boundary check between provider data and ledger state.
    pub fn validate(&self) -> Result<()> {
        if self.org_id.trim().is_empty() {
            return Err(PaymentError::MalformedPayload(format!(
                "canonical event {} has no organization id",
                self.natural_key
            )));
        }
        if self.natural_key.is_blank() {
            return Err(PaymentError::MalformedPayload(format!(
                "canonical {} event for org {} has no natural key",
                self.kind, self.org_id
            )));
        }
        if self.provider.trim().is_empty() {
            return Err(PaymentError::MalformedPayload(format!(
                "canonical event {} has no provider",
                self.natural_key
            )));
        }
        if self.entity_id.trim().is_empty() {
            return Err(PaymentError::MalformedPayload(format!(
                "canonical event {} has no entity id",
                self.natural_key
            )));
        }
        if self.amount < MinorUnits::ZERO {
            return Err(PaymentError::MalformedPayload(format!(
                "canonical event {} has a negative amount",
                self.natural_key
            )));
        }
        Ok(())
    }

    /// String field from `details`, if present and non-empty.
    pub fn detail_str(&self, field: &str) -> Option<&str> {
        self.details
            .get(field)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// The payment attempt (charge) a settlement or failure is about. Without
    /// a `charge_id` detail the entity itself stands for the attempt.
    pub fn attempt_id(&self) -> &str {
        self.detail_str("charge_id").unwrap_or(&self.entity_id)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn event(kind: EventKind, entity_id: &str, object_id: &str, amount: i64) -> CanonicalEvent {
        CanonicalEvent {
            provider: "stripe".to_string(),
            kind,
            natural_key: NaturalKey::from_object("stripe", kind, object_id),
            org_id: "org_1".to_string(),
            project_id: Some("proj_1".to_string()),
            entity_id: entity_id.to_string(),
            amount: MinorUnits::new(amount),
            currency: "USD".to_string(),
            occurred_at: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
            details: serde_json::json!({}),
        }
    }
}
