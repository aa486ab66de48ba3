use crate::connectors::ProviderKey;
use crate::connectors::signature::constant_time_eq;
use crate::domain::anomaly::{AnomalyRecord, Finding, UpsertOutcome, open_key};
use crate::domain::audit::{AuditEntry, AuditOutcome};
use crate::domain::canonical::{CanonicalEvent, EntityKind, EntityRef, NaturalKey};
use crate::domain::context::{Operator, TrustedContext};
use crate::domain::job::{Job, JobStatus, NewJob, RetryPolicy};
use crate::domain::ledger::{self, AppliedEventRecord, LedgerEntity};
use crate::domain::ports::{
    AnomalyStore, AuditLog, CommitResult, JobFilter, JobQueue, LedgerStore, OperatorAuthenticator,
    ProjectDirectory, RawEventStore, ReclaimReport,
};
use crate::domain::project::ProjectBinding;
use crate::domain::raw_event::RawEvent;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Insert-only raw webhook storage.
#[derive(Default, Clone)]
pub struct InMemoryRawEventStore {
    events: Arc<RwLock<HashMap<Uuid, RawEvent>>>,
}

impl InMemoryRawEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RawEventStore for InMemoryRawEventStore {
    async fn insert(&self, event: RawEvent) -> Result<()> {
        let mut events = self.events.write().await;
        if events.contains_key(&event.id) {
            return Err(PaymentError::ValidationError(format!(
                "raw event {} already exists",
                event.id
            )));
        }
        events.insert(event.id, event);
        Ok(())
    }

    async fn get(&self, org_id: &str, id: Uuid) -> Result<Option<RawEvent>> {
        let events = self.events.read().await;
        Ok(events.get(&id).filter(|e| e.org_id == org_id).cloned())
    }

    async fn count(&self, org_id: &str) -> Result<usize> {
        let events = self.events.read().await;
        Ok(events.values().filter(|e| e.org_id == org_id).count())
    }
}

#[derive(Default)]
struct JobTables {
    jobs: HashMap<Uuid, Job>,
    /// Ids in enqueue order.
    order: Vec<Uuid>,
    /// Queued jobs by `(available_at, enqueued_at, id)`.
    ready: BTreeSet<(DateTime<Utc>, DateTime<Utc>, Uuid)>,
    /// Processing jobs by `(visible_until, id)`.
    processing: BTreeSet<(DateTime<Utc>, Uuid)>,
}

impl JobTables {
    fn index(&mut self, job: &Job) {
        if let Some(at) = job.ready_at() {
            self.ready.insert((at, job.enqueued_at, job.id));
        }
        if let Some(at) = job.expires_at() {
            self.processing.insert((at, job.id));
        }
    }

    fn unindex(&mut self, job: &Job) {
        if let Some(at) = job.ready_at() {
            self.ready.remove(&(at, job.enqueued_at, job.id));
        }
        if let Some(at) = job.expires_at() {
            self.processing.remove(&(at, job.id));
        }
    }

    /// Applies `update` to one job if `guard` holds, moving it between the
    /// indexes. `Ok(None)` means the guard failed.
    fn update<G, F>(&mut self, id: Uuid, guard: G, update: F) -> Result<Option<Job>>
    where
        G: FnOnce(&Job) -> bool,
        F: FnOnce(&mut Job),
    {
        let mut job = self
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("job {id}")))?;
        if !guard(&job) {
            return Ok(None);
        }
        self.unindex(&job);
        update(&mut job);
        self.index(&job);
        self.jobs.insert(id, job.clone());
        Ok(Some(job))
    }
}

/// Job queue with a ready index and a processing index, so a poll only
/// touches jobs that are due however much history the queue holds.
#[derive(Default, Clone)]
pub struct InMemoryJobQueue {
    tables: Arc<Mutex<JobTables>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let job = Job::new(job, now);
        let mut tables = self.tables.lock().await;
        tables.index(&job);
        tables.order.push(job.id);
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<Job>> {
        let mut tables = self.tables.lock().await;
        let due: Vec<Uuid> = tables
            .ready
            .iter()
            .take_while(|(available_at, _, _)| *available_at <= now)
            .take(limit)
            .map(|&(_, _, id)| id)
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let job = tables.update(
                id,
                |job| job.is_claimable(now),
                |job| {
                    job.claim(now, policy.visibility_timeout);
                },
            )?;
            claimed.extend(job);
        }
        Ok(claimed)
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<ReclaimReport> {
        let mut tables = self.tables.lock().await;
        let expired: Vec<Uuid> = tables
            .processing
            .iter()
            .take_while(|(visible_until, _)| *visible_until <= now)
            .map(|&(_, id)| id)
            .collect();

        let mut report = ReclaimReport::default();
        for id in expired {
            match tables.update(id, |job| job.is_expired(now), |job| job.reclaim(now, policy))? {
                Some(job) if job.status == JobStatus::Failed => report.failed += 1,
                Some(_) => report.requeued += 1,
                None => {}
            }
        }
        Ok(report)
    }

    async fn complete(&self, id: Uuid, claim_token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let job = tables.update(id, |job| job.holds_claim(claim_token), |job| job.complete(now))?;
        Ok(job.is_some())
    }

    async fn fail_attempt(
        &self,
        id: Uuid,
        claim_token: Uuid,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let job = tables.update(
            id,
            |job| job.holds_claim(claim_token),
            |job| job.fail_attempt(error, retry_at, now),
        )?;
        Ok(job.is_some())
    }

    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let job = tables.update(
            id,
            |job| job.status == JobStatus::Failed,
            |job| {
                job.requeue(now);
            },
        )?;
        Ok(job.is_some())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let tables = self.tables.lock().await;
        Ok(tables.jobs.get(&id).cloned())
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let tables = self.tables.lock().await;
        let limit = if filter.limit == 0 {
            usize::MAX
        } else {
            filter.limit
        };
        Ok(tables
            .order
            .iter()
            .filter_map(|id| tables.jobs.get(id))
            .filter(|job| filter.org_id.as_deref().is_none_or(|org| job.org_id == org))
            .filter(|job| filter.status.is_none_or(|status| job.status == status))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct LedgerTables {
    applied: HashMap<(String, NaturalKey), AppliedEventRecord>,
    entities: HashMap<(String, EntityRef), LedgerEntity>,
}

/// Applied-event records and ledger entities behind one lock, so the
/// check-then-insert and the entity mutation are a single atomic unit.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    tables: Arc<Mutex<LedgerTables>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn applied_record(
        &self,
        org_id: &str,
        key: &NaturalKey,
    ) -> Result<Option<AppliedEventRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .applied
            .get(&(org_id.to_string(), key.clone()))
            .cloned())
    }

    async fn commit(
        &self,
        ctx: &TrustedContext,
        event: &CanonicalEvent,
        now: DateTime<Utc>,
    ) -> Result<CommitResult> {
        let mut tables = self.tables.lock().await;
        let applied_key = (event.org_id.clone(), event.natural_key.clone());
        if let Some(existing) = tables.applied.get(&applied_key) {
            return Ok(CommitResult::AlreadyApplied(existing.clone()));
        }

        let entity_key = (event.org_id.clone(), event.entity_ref());
        let current = tables.entities.get(&entity_key).cloned();
        let (entity, outcome) = ledger::apply_event(current, event)?;
        let record = ledger::applied_record(ctx, event, outcome, now);

        tables.entities.insert(entity_key, entity);
        tables.applied.insert(applied_key, record.clone());
        Ok(CommitResult::Committed(record))
    }

    async fn get_entity(&self, org_id: &str, entity: &EntityRef) -> Result<Option<LedgerEntity>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .entities
            .get(&(org_id.to_string(), entity.clone()))
            .cloned())
    }

    async fn list_entities(
        &self,
        org_id: &str,
        kind: EntityKind,
        after: Option<&EntityRef>,
        limit: usize,
    ) -> Result<Vec<LedgerEntity>> {
        let tables = self.tables.lock().await;
        let mut entities: Vec<(&EntityRef, &LedgerEntity)> = tables
            .entities
            .iter()
            .filter(|((org, entity), _)| org == org_id && entity.kind == kind)
            .filter(|((_, entity), _)| after.is_none_or(|cursor| entity > cursor))
            .map(|((_, entity), value)| (entity, value))
            .collect();
        entities.sort_by(|a, b| a.0.cmp(b.0));
        Ok(entities
            .into_iter()
            .take(limit)
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn count_applied(&self, org_id: &str) -> Result<usize> {
        let tables = self.tables.lock().await;
        Ok(tables.applied.keys().filter(|(org, _)| org == org_id).count())
    }

    async fn org_ids(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock().await;
        let orgs: BTreeSet<String> = tables
            .entities
            .keys()
            .map(|(org, _)| org.clone())
            .collect();
        Ok(orgs.into_iter().collect())
    }
}

#[derive(Default)]
struct AnomalyTables {
    records: Vec<AnomalyRecord>,
    /// Open key to index in `records`.
    open: HashMap<String, usize>,
}

#[derive(Default, Clone)]
pub struct InMemoryAnomalyStore {
    tables: Arc<Mutex<AnomalyTables>>,
}

impl InMemoryAnomalyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnomalyStore for InMemoryAnomalyStore {
    async fn upsert_open(
        &self,
        ctx: &TrustedContext,
        finding: Finding,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut tables = self.tables.lock().await;
        let key = open_key(&finding.org_id, &finding.detector, &finding.entity);
        if tables.open.contains_key(&key) {
            return Ok(UpsertOutcome::AlreadyOpen);
        }
        let idx = tables.records.len();
        tables.records.push(AnomalyRecord::open(ctx, finding, now));
        tables.open.insert(key, idx);
        Ok(UpsertOutcome::Created)
    }

    async fn resolve_open(
        &self,
        ctx: &TrustedContext,
        org_id: &str,
        detector: &str,
        entity: &EntityRef,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(idx) = tables.open.remove(&open_key(org_id, detector, entity)) else {
            return Ok(false);
        };
        tables.records[idx].resolve(ctx, now);
        Ok(true)
    }

    async fn list_open(&self, org_id: &str, detector: &str) -> Result<Vec<AnomalyRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .records
            .iter()
            .filter(|r| r.is_open() && r.org_id == org_id && r.detector == detector)
            .cloned()
            .collect())
    }

    async fn list(&self, org_id: &str, include_resolved: bool) -> Result<Vec<AnomalyRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .records
            .iter()
            .filter(|r| r.org_id == org_id && (include_resolved || r.is_open()))
            .cloned()
            .collect())
    }
}

/// Project bindings loaded once at startup.
#[derive(Debug, Default, Clone)]
pub struct InMemoryProjectDirectory {
    by_key: Arc<HashMap<String, ProjectBinding>>,
}

impl InMemoryProjectDirectory {
    /// Fails if two bindings share a webhook key.
    pub fn new(bindings: Vec<ProjectBinding>) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(bindings.len());
        for binding in bindings {
            if by_key.contains_key(&binding.webhook_key) {
                return Err(PaymentError::ValidationError(format!(
                    "duplicate webhook key '{}'",
                    binding.webhook_key
                )));
            }
            by_key.insert(binding.webhook_key.clone(), binding);
        }
        Ok(Self {
            by_key: Arc::new(by_key),
        })
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[async_trait]
impl ProjectDirectory for InMemoryProjectDirectory {
    async fn resolve_webhook_key(&self, key: &str) -> Result<Option<ProjectBinding>> {
        Ok(self.by_key.get(key).cloned())
    }

    async fn bindings_for(
        &self,
        org_id: &str,
        provider: ProviderKey,
    ) -> Result<Vec<ProjectBinding>> {
        let mut bindings: Vec<ProjectBinding> = self
            .by_key
            .values()
            .filter(|b| b.org_id == org_id && b.provider == provider)
            .cloned()
            .collect();
        bindings.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(bindings)
    }
}

/// Audit trail that also emits every entry as a `tracing` event.
#[derive(Default, Clone)]
pub struct InMemoryAuditLog {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> AuditOutcome {
        tracing::info!(
            target: "payrail::audit",
            principal = %entry.principal,
            action = %entry.action,
            org_id = %entry.org_id,
            target_ref = %entry.target,
            "audit"
        );
        self.entries.lock().await.push(entry);
        AuditOutcome::Logged
    }
}

/// Operator credentials provisioned through configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticOperatorAuthenticator {
    operators: Arc<Vec<(String, Operator)>>,
}

impl StaticOperatorAuthenticator {
    pub fn new(operators: Vec<(String, Operator)>) -> Self {
        Self {
            operators: Arc::new(operators),
        }
    }
}

#[async_trait]
impl OperatorAuthenticator for StaticOperatorAuthenticator {
    async fn authenticate(&self, bearer_token: &str) -> Result<Option<Operator>> {
        if bearer_token.is_empty() {
            return Ok(None);
        }
        Ok(self
            .operators
            .iter()
            .find(|(token, _)| constant_time_eq(token.as_bytes(), bearer_token.as_bytes()))
            .map(|(_, operator)| operator.clone()))
    }
}
