use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Request headers with lower-cased names, in deterministic order.
pub type HeaderMapping = BTreeMap<String, String>;

/// Event type recorded for verified webhooks the connector could not parse.
pub const UNPARSED_EVENT_TYPE: &str = "unparsed";

/// A verified webhook exactly as received, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEnvelope {
    pub id: Uuid,
    pub org_id: String,
    pub project_id: String,
    pub headers: HeaderMapping,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl WebhookEnvelope {
    pub fn new(
        org_id: impl Into<String>,
        project_id: impl Into<String>,
        headers: HeaderMapping,
        body: Vec<u8>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: org_id.into(),
            project_id: project_id.into(),
            headers,
            body,
            received_at,
        }
    }
}

/// A persisted webhook. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: Uuid,
    pub org_id: String,
    pub project_id: String,
    pub provider: String,
    pub event_type: String,
    pub headers: HeaderMapping,
    #[serde(serialize_with = "encode_body", deserialize_with = "decode_body")]
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn from_envelope(
        provider: impl Into<String>,
        event_type: impl Into<String>,
        envelope: WebhookEnvelope,
    ) -> Self {
        Self {
            id: envelope.id,
            org_id: envelope.org_id,
            project_id: envelope.project_id,
            provider: provider.into(),
            event_type: event_type.into(),
            headers: envelope.headers,
            body: envelope.body,
            received_at: envelope.received_at,
        }
    }

    /// Keeps a verified payload whose structure the connector rejected.
    pub fn unparsed(provider: impl Into<String>, envelope: WebhookEnvelope) -> Self {
        Self::from_envelope(provider, UNPARSED_EVENT_TYPE, envelope)
    }

    pub fn is_unparsed(&self) -> bool {
        self.event_type == UNPARSED_EVENT_TYPE
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The delivery this event was built from, keeping its id.
    pub fn to_envelope(&self) -> WebhookEnvelope {
        WebhookEnvelope {
            id: self.id,
            org_id: self.org_id.clone(),
            project_id: self.project_id.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            received_at: self.received_at,
        }
    }
}

fn encode_body<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(body))
}

fn decode_body<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_keeps_body_bytes_through_serde() {
        let body = vec![0xff, 0x00, b'{', b'}'];
        let envelope = WebhookEnvelope::new(
            "org_1",
            "proj_1",
            HeaderMapping::new(),
            body.clone(),
            Utc::now(),
        );
        let raw = RawEvent::from_envelope("stripe", "charge.succeeded", envelope);

        let json = serde_json::to_vec(&raw).unwrap();
        let back: RawEvent = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.body, body);
        assert_eq!(back, raw);
    }

    #[test]
    fn test_unparsed_marker() {
        let envelope = WebhookEnvelope::new(
            "org_1",
            "proj_1",
            HeaderMapping::new(),
            b"nope".to_vec(),
            Utc::now(),
        );
        let raw = RawEvent::unparsed("shopify", envelope);
        assert!(raw.is_unparsed());
    }
}
