use super::canonical::EntityRef;
use super::context::TrustedContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A condition a detector wants open. Becomes an [`AnomalyRecord`] unless
/// one is already open for the same detector, organization and entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub detector: String,
    pub org_id: String,
    pub entity: EntityRef,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: Uuid,
    pub detector: String,
    pub org_id: String,
    pub entity: EntityRef,
    pub severity: Severity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    /// Principal that opened the record.
    #[serde(default)]
    pub detected_by: String,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
}

impl AnomalyRecord {
    pub fn open(ctx: &TrustedContext, finding: Finding, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            detector: finding.detector,
            org_id: finding.org_id,
            entity: finding.entity,
            severity: finding.severity,
            description: finding.description,
            detected_at: now,
            detected_by: ctx.principal().to_string(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn resolve(&mut self, ctx: &TrustedContext, now: DateTime<Utc>) {
        self.resolved_at = Some(now);
        self.resolved_by = Some(ctx.principal().to_string());
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Identity used for upsert: at most one open anomaly per key.
    pub fn open_key(&self) -> String {
        open_key(&self.org_id, &self.detector, &self.entity)
    }
}

pub fn open_key(org_id: &str, detector: &str, entity: &EntityRef) -> String {
    format!("{org_id}/{detector}/{entity}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    AlreadyOpen,
}
