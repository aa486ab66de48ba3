use crate::domain::canonical::CanonicalEvent;
use crate::domain::context::TrustedContext;
use crate::domain::ledger::ApplyOutcome;
use crate::domain::ports::{CommitResult, LedgerStoreRef};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

/// Applies canonical events to ledger state, at most once per natural key.
///
/// The engine owns no state; idempotency rests entirely on the store's
/// atomic check-then-insert of the applied-event record.
#[derive(Clone)]
pub struct EventApplicationEngine {
    ledger: LedgerStoreRef,
}

impl EventApplicationEngine {
    pub fn new(ledger: LedgerStoreRef) -> Self {
        Self { ledger }
    }

    /// Validates the whole batch, then commits each event in occurred-at
    /// order (natural key breaks ties).
    ///
    /// A validation failure rejects the batch before anything is written. A
    /// storage failure mid-batch leaves earlier events committed; the retry
    /// skips them.
    #[tracing::instrument(skip_all, fields(events = events.len()))]
    pub async fn apply_batch(
        &self,
        ctx: &TrustedContext,
        mut events: Vec<CanonicalEvent>,
        now: DateTime<Utc>,
    ) -> Result<ApplyReport> {
        for event in &events {
            event.validate()?;
        }
        events.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.natural_key.cmp(&b.natural_key))
        });

        let mut report = ApplyReport::default();
        for event in &events {
            if self
                .ledger
                .applied_record(&event.org_id, &event.natural_key)
                .await?
                .is_some()
            {
                debug!(natural_key = %event.natural_key, "already applied, skipping");
                report.skipped += 1;
                continue;
            }

            match self.ledger.commit(ctx, event, now).await? {
                CommitResult::Committed(record) => {
                    report.applied += 1;
                    if let ApplyOutcome::Conflict { reason } = &record.outcome {
                        report.conflicts += 1;
                        warn!(
                            org_id = %event.org_id,
                            natural_key = %event.natural_key,
                            entity = %record.entity,
                            reason = %reason,
                            "event contradicts recorded facts"
                        );
                    }
                }
                CommitResult::AlreadyApplied(_) => {
                    debug!(natural_key = %event.natural_key, "lost race to a concurrent apply");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }
}
