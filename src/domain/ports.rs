use super::anomaly::{AnomalyRecord, Finding, UpsertOutcome};
use super::audit::{AuditEntry, AuditOutcome};
use super::canonical::{CanonicalEvent, EntityKind, EntityRef, NaturalKey};
use super::context::{Operator, TrustedContext};
use super::job::{Job, JobStatus, NewJob, RetryPolicy};
use super::ledger::{AppliedEventRecord, LedgerEntity};
use super::project::ProjectBinding;
use super::raw_event::{HeaderMapping, RawEvent};
use crate::connectors::ProviderKey;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait RawEventStore: Send + Sync {
    /// Insert-only. Inserting an id that already exists is an error.
    async fn insert(&self, event: RawEvent) -> Result<()>;
    async fn get(&self, org_id: &str, id: Uuid) -> Result<Option<RawEvent>>;
    async fn count(&self, org_id: &str) -> Result<usize>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub org_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub requeued: usize,
    pub failed: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job>;

    /// Atomically moves up to `limit` claimable jobs, oldest first, to
    /// `processing`. A job is returned to at most one caller per claim.
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<Job>>;

    /// Returns `processing` jobs whose visibility deadline has passed to the
    /// queue (or fails them once their attempts are used up).
    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<ReclaimReport>;

    /// Marks the job completed if `claim_token` still owns it.
    async fn complete(&self, id: Uuid, claim_token: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Records a failed attempt if `claim_token` still owns the job. With
    /// `retry_at` the job is re-queued, otherwise it is failed for good.
    async fn fail_attempt(
        &self,
        id: Uuid,
        claim_token: Uuid,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;
    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Committed(AppliedEventRecord),
    AlreadyApplied(AppliedEventRecord),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn applied_record(
        &self,
        org_id: &str,
        key: &NaturalKey,
    ) -> Result<Option<AppliedEventRecord>>;

    /// Check-then-insert the applied record and mutate the target entity as
    /// one atomic unit. If a record for the natural key already exists
    /// nothing is written.
    async fn commit(
        &self,
        ctx: &TrustedContext,
        event: &CanonicalEvent,
        now: DateTime<Utc>,
    ) -> Result<CommitResult>;

    async fn get_entity(&self, org_id: &str, entity: &EntityRef) -> Result<Option<LedgerEntity>>;

    /// One page of entities of `kind` in [`EntityRef`] order, starting
    /// strictly after `after` (or at the first one).
    async fn list_entities(
        &self,
        org_id: &str,
        kind: EntityKind,
        after: Option<&EntityRef>,
        limit: usize,
    ) -> Result<Vec<LedgerEntity>>;
    async fn count_applied(&self, org_id: &str) -> Result<usize>;
    async fn org_ids(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait AnomalyStore: Send + Sync {
    async fn upsert_open(
        &self,
        ctx: &TrustedContext,
        finding: Finding,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    /// Resolves the open anomaly for this detector and entity, if any.
    async fn resolve_open(
        &self,
        ctx: &TrustedContext,
        org_id: &str,
        detector: &str,
        entity: &EntityRef,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_open(&self, org_id: &str, detector: &str) -> Result<Vec<AnomalyRecord>>;
    async fn list(&self, org_id: &str, include_resolved: bool) -> Result<Vec<AnomalyRecord>>;
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn resolve_webhook_key(&self, key: &str) -> Result<Option<ProjectBinding>>;
    async fn bindings_for(
        &self,
        org_id: &str,
        provider: ProviderKey,
    ) -> Result<Vec<ProjectBinding>>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> AuditOutcome;
}

/// A webhook recovered from a provider's API rather than delivered to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedWebhook {
    pub headers: HeaderMapping,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Outbound provider calls used by `sync_provider` jobs to recover
/// deliveries the provider reports as sent but we never received.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn fetch_missed(
        &self,
        binding: &ProjectBinding,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedWebhook>>;
}

/// Resolves a bearer credential to an operator. Authentication and role
/// administration live outside this crate; this is the seam they plug into.
#[async_trait]
pub trait OperatorAuthenticator: Send + Sync {
    async fn authenticate(&self, bearer_token: &str) -> Result<Option<Operator>>;
}

pub type RawEventStoreRef = Arc<dyn RawEventStore>;
pub type JobQueueRef = Arc<dyn JobQueue>;
pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type AnomalyStoreRef = Arc<dyn AnomalyStore>;
pub type ProjectDirectoryRef = Arc<dyn ProjectDirectory>;
pub type AuditLogRef = Arc<dyn AuditLog>;
pub type OperatorAuthenticatorRef = Arc<dyn OperatorAuthenticator>;
pub type ProviderApiRef = Arc<dyn ProviderApi>;
