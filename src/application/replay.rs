use super::engine::{ApplyReport, EventApplicationEngine};
use crate::connectors::{ConnectorRegistry, ProviderKey};
use crate::domain::audit::{AuditEntry, AuditOutcome};
use crate::domain::context::Operator;
use crate::domain::ports::{AuditLogRef, RawEventStoreRef};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Body of `POST /ops/replay`. Every field is optional at the type level so
/// a missing one is reported as a validation error instead of a decode
/// failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    pub org_id: Option<String>,
    pub provider: Option<String>,
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub raw_event_id: Uuid,
    pub event_type: String,
    /// Canonical events the payload normalized to.
    pub events: usize,
    pub applied: ApplyReport,
    pub audit: AuditOutcome,
}

/// Operator-triggered re-run of normalization and application for one raw
/// event. Safe to repeat: already-applied natural keys are skipped.
pub struct ReplayService {
    registry: Arc<ConnectorRegistry>,
    raw_events: RawEventStoreRef,
    engine: EventApplicationEngine,
    audit: AuditLogRef,
    require_audit: bool,
}

impl ReplayService {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        raw_events: RawEventStoreRef,
        engine: EventApplicationEngine,
        audit: AuditLogRef,
    ) -> Self {
        Self {
            registry,
            raw_events,
            engine,
            audit,
            require_audit: false,
        }
    }

    /// Refuse to replay when the audit entry cannot be written.
    pub fn require_audit(mut self, require: bool) -> Self {
        self.require_audit = require;
        self
    }

    #[tracing::instrument(skip_all, fields(user_id = %operator.user_id))]
    pub async fn replay(
        &self,
        operator: &Operator,
        request: ReplayRequest,
        now: DateTime<Utc>,
    ) -> Result<ReplayReport> {
        let present = |field: Option<String>| field.filter(|s| !s.trim().is_empty());
        let (org_id, provider, event_id) = match (
            present(request.org_id),
            present(request.provider),
            present(request.event_id),
        ) {
            (Some(org), Some(provider), Some(event)) => (org, provider, event),
            _ => {
                return Err(PaymentError::ValidationError(
                    "orgId, provider and eventId are required".into(),
                ));
            }
        };
        if !operator.can_access(&org_id) {
            return Err(PaymentError::Forbidden(format!(
                "user {} may not act on org {org_id}",
                operator.user_id
            )));
        }
        let provider: ProviderKey = provider
            .parse()
            .map_err(|e: PaymentError| PaymentError::ValidationError(e.to_string()))?;
        let raw_event_id = Uuid::parse_str(event_id.trim())
            .map_err(|e| PaymentError::ValidationError(format!("invalid eventId: {e}")))?;

        let audit = self
            .audit
            .record(AuditEntry {
                principal: operator.context(now).principal().clone(),
                action: "replay".into(),
                org_id: org_id.clone(),
                target: format!("raw_event:{raw_event_id}"),
                at: now,
            })
            .await;
        if let AuditOutcome::FailedToLog(reason) = &audit {
            warn!(%raw_event_id, reason = %reason, "replay audit entry not written");
            if self.require_audit {
                return Err(PaymentError::internal(format!(
                    "audit entry could not be written: {reason}"
                )));
            }
        }

        let raw = self
            .raw_events
            .get(&org_id, raw_event_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("raw event {raw_event_id}")))?;
        if raw.provider != provider.as_str() {
            return Err(PaymentError::ValidationError(format!(
                "raw event {raw_event_id} came from {}, not {provider}",
                raw.provider
            )));
        }

        let connector = self.registry.resolve(provider);
        // Unparsed payloads get another chance, e.g. after a connector fix.
        let raw = if raw.is_unparsed() {
            connector.parse_webhook(raw.to_envelope())?
        } else {
            raw
        };
        let events = connector.normalize(&raw)?;
        let count = events.len();
        let applied = self
            .engine
            .apply_batch(&operator.context(now), events, now)
            .await?;

        info!(
            %raw_event_id,
            org_id = %org_id,
            events = count,
            applied = applied.applied,
            skipped = applied.skipped,
            "replay finished"
        );
        Ok(ReplayReport {
            raw_event_id,
            event_type: raw.event_type,
            events: count,
            applied,
            audit,
        })
    }
}
