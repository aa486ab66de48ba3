//! Consistency detector framework.
//!
//! A [`Detector`] inspects committed ledger state for one organization and
//! raises findings through its [`DetectorContext`]. The [`DetectorRunner`]
//! runs every detector in its own task so one failing detector never stops
//! the others, and reports each detector's outcome separately.

use crate::domain::anomaly::{Finding, Severity, UpsertOutcome};
use crate::domain::canonical::{EntityKind, EntityRef};
use crate::domain::context::TrustedContext;
use crate::domain::ledger::LedgerEntity;
use crate::domain::ports::{AnomalyStore, AnomalyStoreRef, LedgerStore, LedgerStoreRef};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Must be idempotent: raising a finding that is already open is a
    /// no-op.
    async fn run(&self, cx: &mut DetectorContext<'_>) -> Result<()>;
}

pub type DetectorRef = Arc<dyn Detector>;

/// Per-organization scope handed to a detector.
///
/// Tracks which entities the detector looked at and which it flagged, so
/// open anomalies on entities that were checked and came back clean can be
/// resolved after the run.
pub struct DetectorContext<'a> {
    detector: &'static str,
    org_id: &'a str,
    now: DateTime<Utc>,
    batch_limit: usize,
    trusted: &'a TrustedContext,
    ledger: &'a dyn LedgerStore,
    anomalies: &'a dyn AnomalyStore,
    checked: BTreeSet<EntityRef>,
    raised: BTreeSet<EntityRef>,
    created: usize,
}

impl<'a> DetectorContext<'a> {
    pub fn org_id(&self) -> &'a str {
        self.org_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Upper bound on entities a detector holds in memory at once.
    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    pub fn ledger(&self) -> &'a dyn LedgerStore {
        self.ledger
    }

    /// Every entity of `kind` in this organization, one batch at a time.
    pub fn pages(&self, kind: EntityKind) -> EntityPages<'a> {
        EntityPages {
            ledger: self.ledger,
            org_id: self.org_id,
            kind,
            limit: self.batch_limit,
            after: None,
            exhausted: false,
        }
    }

    /// Records that `entity` was inspected and is consistent.
    pub fn mark_checked(&mut self, entity: EntityRef) {
        self.checked.insert(entity);
    }

    /// Opens an anomaly for `entity` unless one is already open.
    pub async fn raise(
        &mut self,
        entity: EntityRef,
        severity: Severity,
        description: String,
    ) -> Result<UpsertOutcome> {
        self.checked.insert(entity.clone());
        self.raised.insert(entity.clone());
        let finding = Finding {
            detector: self.detector.to_string(),
            org_id: self.org_id.to_string(),
            entity,
            severity,
            description,
        };
        let outcome = self
            .anomalies
            .upsert_open(self.trusted, finding, self.now)
            .await?;
        if outcome == UpsertOutcome::Created {
            self.created += 1;
        }
        Ok(outcome)
    }

    async fn resolve_cleared(&self) -> Result<usize> {
        let open = self.anomalies.list_open(self.org_id, self.detector).await?;
        let mut resolved = 0;
        for record in open {
            if self.checked.contains(&record.entity) && !self.raised.contains(&record.entity) {
                let done = self
                    .anomalies
                    .resolve_open(
                        self.trusted,
                        self.org_id,
                        self.detector,
                        &record.entity,
                        self.now,
                    )
                    .await?;
                if done {
                    resolved += 1;
                }
            }
        }
        Ok(resolved)
    }
}

/// Cursor over one organization's entities of a kind, `batch_limit` at a
/// time, so a run covers the whole organization with a bounded working set.
pub struct EntityPages<'a> {
    ledger: &'a dyn LedgerStore,
    org_id: &'a str,
    kind: EntityKind,
    limit: usize,
    after: Option<EntityRef>,
    exhausted: bool,
}

impl EntityPages<'_> {
    /// The next page, or `None` once every entity has been returned.
    pub async fn next_page(&mut self) -> Result<Option<Vec<LedgerEntity>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .ledger
            .list_entities(self.org_id, self.kind, self.after.as_ref(), self.limit)
            .await?;
        if page.len() < self.limit {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.after = Some(last.entity_ref());
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectorOutcome {
    pub detector: String,
    pub org_id: String,
    pub checked: usize,
    pub raised: usize,
    pub created: usize,
    pub resolved: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectorError {
    pub detector: String,
    pub org_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub checked: usize,
    pub errors: Vec<DetectorError>,
    pub outcomes: Vec<DetectorOutcome>,
}

pub struct DetectorRunner {
    detectors: Vec<DetectorRef>,
    ledger: LedgerStoreRef,
    anomalies: AnomalyStoreRef,
    batch_limit: usize,
}

impl DetectorRunner {
    pub fn new(ledger: LedgerStoreRef, anomalies: AnomalyStoreRef, batch_limit: usize) -> Self {
        Self {
            detectors: Vec::new(),
            ledger,
            anomalies,
            batch_limit: batch_limit.max(1),
        }
    }

    pub fn with_detector(mut self, detector: DetectorRef) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Runs the selected detectors (all when `only` is empty) over the given
    /// organizations, or over every organization with ledger state.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        &self,
        ctx: &TrustedContext,
        org_ids: Option<Vec<String>>,
        only: &[String],
        now: DateTime<Utc>,
    ) -> Result<ConsistencyReport> {
        let org_ids = match org_ids {
            Some(ids) => ids,
            None => self.ledger.org_ids().await?,
        };
        let mut report = ConsistencyReport::default();

        for name in only {
            if !self.detectors.iter().any(|d| d.name() == name) {
                report.errors.push(DetectorError {
                    detector: name.clone(),
                    org_id: None,
                    error: "unknown detector".to_string(),
                });
            }
        }

        let org_ids = Arc::new(org_ids);
        let mut tasks = JoinSet::new();
        let mut task_names = HashMap::new();
        for detector in self
            .detectors
            .iter()
            .filter(|d| only.is_empty() || only.iter().any(|n| n == d.name()))
        {
            let detector = detector.clone();
            let ledger = self.ledger.clone();
            let anomalies = self.anomalies.clone();
            let org_ids = org_ids.clone();
            let trusted = ctx.clone();
            let batch_limit = self.batch_limit;
            let name = detector.name();
            let handle = tasks.spawn(async move {
                run_detector(
                    detector,
                    ledger,
                    anomalies,
                    &trusted,
                    &org_ids,
                    batch_limit,
                    now,
                )
                .await
            });
            task_names.insert(handle.id(), name);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, outcomes)) => {
                    for outcome in outcomes {
                        report.checked += outcome.checked;
                        if let Some(error) = &outcome.error {
                            report.errors.push(DetectorError {
                                detector: outcome.detector.clone(),
                                org_id: Some(outcome.org_id.clone()),
                                error: error.clone(),
                            });
                        }
                        report.outcomes.push(outcome);
                    }
                }
                Err(join_error) => {
                    let name = task_names
                        .get(&join_error.id())
                        .copied()
                        .unwrap_or("unknown");
                    error!(detector = name, error = %join_error, "detector task aborted");
                    report.errors.push(DetectorError {
                        detector: name.to_string(),
                        org_id: None,
                        error: join_error.to_string(),
                    });
                }
            }
        }

        report
            .outcomes
            .sort_by(|a, b| (&a.detector, &a.org_id).cmp(&(&b.detector, &b.org_id)));
        report
            .errors
            .sort_by(|a, b| (&a.detector, &a.org_id).cmp(&(&b.detector, &b.org_id)));
        info!(
            checked = report.checked,
            errors = report.errors.len(),
            "consistency run finished"
        );
        Ok(report)
    }
}

async fn run_detector(
    detector: DetectorRef,
    ledger: LedgerStoreRef,
    anomalies: AnomalyStoreRef,
    trusted: &TrustedContext,
    org_ids: &[String],
    batch_limit: usize,
    now: DateTime<Utc>,
) -> Vec<DetectorOutcome> {
    let mut outcomes = Vec::with_capacity(org_ids.len());
    for org_id in org_ids {
        let mut cx = DetectorContext {
            detector: detector.name(),
            org_id,
            now,
            batch_limit,
            trusted,
            ledger: ledger.as_ref(),
            anomalies: anomalies.as_ref(),
            checked: BTreeSet::new(),
            raised: BTreeSet::new(),
            created: 0,
        };
        let result = match detector.run(&mut cx).await {
            Ok(()) => cx.resolve_cleared().await,
            Err(e) => Err(e),
        };
        let (resolved, error) = match result {
            Ok(resolved) => (resolved, None),
            Err(e) => {
                warn!(detector = detector.name(), %org_id, error = %e, "detector failed");
                (0, Some(e.to_string()))
            }
        };
        outcomes.push(DetectorOutcome {
            detector: detector.name().to_string(),
            org_id: org_id.clone(),
            checked: cx.checked.len(),
            raised: cx.raised.len(),
            created: cx.created,
            resolved,
            error,
        });
    }
    outcomes
}
