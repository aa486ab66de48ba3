use super::context::Principal;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub principal: Principal,
    pub action: String,
    pub org_id: String,
    pub target: String,
    pub at: DateTime<Utc>,
}

/// Result of writing an audit entry. Callers on a critical path decide
/// whether `FailedToLog` should block the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AuditOutcome {
    Logged,
    FailedToLog(String),
}

impl AuditOutcome {
    pub fn is_logged(&self) -> bool {
        matches!(self, AuditOutcome::Logged)
    }
}
