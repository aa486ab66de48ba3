use crate::domain::anomaly::{AnomalyRecord, Finding, UpsertOutcome, open_key};
use crate::domain::canonical::{CanonicalEvent, EntityKind, EntityRef, NaturalKey};
use crate::domain::context::TrustedContext;
use crate::domain::job::{Job, JobStatus, NewJob, RetryPolicy};
use crate::domain::ledger::{self, AppliedEventRecord, LedgerEntity};
use crate::domain::ports::{
    AnomalyStore, CommitResult, JobFilter, JobQueue, LedgerStore, RawEventStore, ReclaimReport,
};
use crate::domain::raw_event::RawEvent;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode,
    OptimisticTransactionDB, Options,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Verified webhooks, keyed `{org}\0{raw event id}`.
pub const CF_RAW_EVENTS: &str = "raw_events";
/// Jobs keyed by job id.
pub const CF_JOBS: &str = "jobs_queue";
/// Queued jobs keyed `{available_at}{enqueued_at}{id}`, empty values.
pub const CF_JOBS_READY: &str = "jobs_ready";
/// Processing jobs keyed `{visible_until}{id}`, empty values.
pub const CF_JOBS_PROCESSING: &str = "jobs_processing";
/// Applied-event records keyed `{org}\0{natural key}`.
pub const CF_APPLIED: &str = "applied_event_records";
/// Ledger entities keyed `{org}\0{kind}\0{provider}\0{id}`.
pub const CF_ENTITIES: &str = "ledger_entities";
/// Anomaly records keyed `{org}\0{anomaly id}`.
pub const CF_ANOMALIES: &str = "anomaly_records";
/// Open-anomaly key to the id of the open record.
pub const CF_ANOMALY_OPEN: &str = "anomaly_open_index";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_RAW_EVENTS,
    CF_JOBS,
    CF_JOBS_READY,
    CF_JOBS_PROCESSING,
    CF_APPLIED,
    CF_ENTITIES,
    CF_ANOMALIES,
    CF_ANOMALY_OPEN,
];

const SEP: char = '\0';

/// A persistent store implementation using RocksDB.
///
/// Implements every storage port with one column family per logical table,
/// plus two job indexes (ready and processing) kept in the same transaction
/// as the job row, so claim and reclaim are range scans over due jobs only.
/// Conditional writes (raw event insert, job claim and outcome, ledger
/// commit, anomaly upsert) read their guard rows with `get_for_update`
/// inside an optimistic transaction, so two writers racing on the same rows
/// cannot both commit. The loser sees a busy error, surfaced as
/// `TransientStorage` and retried by the job machinery.
///
/// Transactions never live across an `.await`; every port method does its
/// storage work in one synchronous section.
///
/// This struct is thread-safe (`Clone` shares the underlying database).
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<OptimisticTransactionDB>,
}

impl RocksDbStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that all required column families exist.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::internal(format!("{name} column family not found")))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf)?;
        self.db
            .get_cf(cf, key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf: &str,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<T>> {
        self.scan_prefix_after(cf, prefix, None, limit)
    }

    /// Like [`Self::scan_prefix`], skipping keys up to and including `after`.
    fn scan_prefix_after<T: DeserializeOwned>(
        &self,
        cf: &str,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<T>> {
        let cf = self.cf(cf)?;
        let start = after.filter(|key| key.starts_with(prefix)).unwrap_or(prefix);
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) || values.len() >= limit {
                break;
            }
            if after.is_some_and(|after| key.as_ref() <= after) {
                continue;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn all_jobs(&self) -> Result<Vec<Job>> {
        self.scan_prefix(CF_JOBS, b"", usize::MAX)
    }

    /// Ids from a job index whose time prefix is at or before `now`, in key
    /// order. Stops at the first later key, so the scan never reads past
    /// the jobs that are due.
    fn due_job_ids(&self, index: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let cf = self.cf(index)?;
        let bound = time_key(now);
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if ids.len() >= limit || key.len() < 8 + 16 || key[..8] > bound[..] {
                break;
            }
            let id = Uuid::from_slice(&key[key.len() - 16..])
                .map_err(|e| PaymentError::internal(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Applies `update` to one job if `guard` holds, as an optimistic
    /// transaction that also moves the job between the ready and
    /// processing indexes. `Ok(None)` means the guard failed or another
    /// writer committed first.
    fn update_job<F, G>(&self, id: Uuid, guard: G, update: F) -> Result<Option<Job>>
    where
        G: FnOnce(&Job) -> bool,
        F: FnOnce(&mut Job),
    {
        let cf = self.cf(CF_JOBS)?;
        let key = id.as_bytes();
        let txn = self.db.transaction();
        let Some(bytes) = txn.get_for_update_cf(cf, key, true)? else {
            return Err(PaymentError::NotFound(format!("job {id}")));
        };
        let mut job: Job = decode(&bytes)?;
        if !guard(&job) {
            return Ok(None);
        }
        for (index, index_key) in job_index_entries(&job) {
            txn.delete_cf(self.cf(index)?, index_key)?;
        }
        update(&mut job);
        for (index, index_key) in job_index_entries(&job) {
            txn.put_cf(self.cf(index)?, index_key, b"")?;
        }
        txn.put_cf(cf, key, encode(&job)?)?;
        match txn.commit() {
            Ok(()) => Ok(Some(job)),
            Err(e) if is_conflict(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn commit_sync(
        &self,
        ctx: &TrustedContext,
        event: &CanonicalEvent,
        now: DateTime<Utc>,
    ) -> Result<CommitResult> {
        let applied_cf = self.cf(CF_APPLIED)?;
        let entities_cf = self.cf(CF_ENTITIES)?;
        let record_key = applied_key(&event.org_id, &event.natural_key);
        let entity_key = entity_key(&event.org_id, &event.entity_ref());

        let txn = self.db.transaction();
        if let Some(bytes) = txn.get_for_update_cf(applied_cf, &record_key, true)? {
            return Ok(CommitResult::AlreadyApplied(decode(&bytes)?));
        }
        let current: Option<LedgerEntity> = txn
            .get_for_update_cf(entities_cf, &entity_key, true)?
            .map(|bytes| decode(&bytes))
            .transpose()?;
        let (entity, outcome) = ledger::apply_event(current, event)?;
        let record = ledger::applied_record(ctx, event, outcome, now);

        txn.put_cf(applied_cf, &record_key, encode(&record)?)?;
        txn.put_cf(entities_cf, &entity_key, encode(&entity)?)?;
        txn.commit()?;
        Ok(CommitResult::Committed(record))
    }

    fn upsert_open_sync(
        &self,
        ctx: &TrustedContext,
        finding: Finding,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let index_cf = self.cf(CF_ANOMALY_OPEN)?;
        let records_cf = self.cf(CF_ANOMALIES)?;
        let open = open_key(&finding.org_id, &finding.detector, &finding.entity);

        let txn = self.db.transaction();
        if txn.get_for_update_cf(index_cf, open.as_bytes(), true)?.is_some() {
            return Ok(UpsertOutcome::AlreadyOpen);
        }
        let record = AnomalyRecord::open(ctx, finding, now);
        txn.put_cf(index_cf, open.as_bytes(), record.id.as_bytes())?;
        txn.put_cf(
            records_cf,
            prefixed(&record.org_id, &record.id.to_string()),
            encode(&record)?,
        )?;
        txn.commit()?;
        Ok(UpsertOutcome::Created)
    }

    fn resolve_open_sync(
        &self,
        ctx: &TrustedContext,
        org_id: &str,
        detector: &str,
        entity: &EntityRef,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let index_cf = self.cf(CF_ANOMALY_OPEN)?;
        let records_cf = self.cf(CF_ANOMALIES)?;
        let open = open_key(org_id, detector, entity);

        let txn = self.db.transaction();
        let Some(id_bytes) = txn.get_for_update_cf(index_cf, open.as_bytes(), true)? else {
            return Ok(false);
        };
        let id = Uuid::from_slice(&id_bytes).map_err(|e| PaymentError::internal(e.to_string()))?;
        let record_key = prefixed(org_id, &id.to_string());
        let Some(bytes) = txn.get_for_update_cf(records_cf, &record_key, true)? else {
            return Err(PaymentError::internal(format!(
                "open index points at missing anomaly {id}"
            )));
        };
        let mut record: AnomalyRecord = decode(&bytes)?;
        record.resolve(ctx, now);
        txn.put_cf(records_cf, &record_key, encode(&record)?)?;
        txn.delete_cf(index_cf, open.as_bytes())?;
        txn.commit()?;
        Ok(true)
    }
}

#[async_trait]
impl RawEventStore for RocksDbStore {
    async fn insert(&self, event: RawEvent) -> Result<()> {
        let cf = self.cf(CF_RAW_EVENTS)?;
        let key = prefixed(&event.org_id, &event.id.to_string());
        let txn = self.db.transaction();
        if txn.get_for_update_cf(cf, &key, true)?.is_some() {
            return Err(PaymentError::ValidationError(format!(
                "raw event {} already exists",
                event.id
            )));
        }
        txn.put_cf(cf, &key, encode(&event)?)?;
        txn.commit()?;
        Ok(())
    }

    async fn get(&self, org_id: &str, id: Uuid) -> Result<Option<RawEvent>> {
        self.get_json(CF_RAW_EVENTS, &prefixed(org_id, &id.to_string()))
    }

    async fn count(&self, org_id: &str) -> Result<usize> {
        let events: Vec<RawEvent> =
            self.scan_prefix(CF_RAW_EVENTS, &prefixed(org_id, ""), usize::MAX)?;
        Ok(events.len())
    }
}

#[async_trait]
impl JobQueue for RocksDbStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let job = Job::new(job, now);
        let txn = self.db.transaction();
        txn.put_cf(self.cf(CF_JOBS)?, job.id.as_bytes(), encode(&job)?)?;
        for (index, index_key) in job_index_entries(&job) {
            txn.put_cf(self.cf(index)?, index_key, b"")?;
        }
        txn.commit()?;
        Ok(job)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<Job>> {
        let mut claimed = Vec::new();
        for id in self.due_job_ids(CF_JOBS_READY, now, limit)? {
            let job = self.update_job(
                id,
                |job| job.is_claimable(now),
                |job| {
                    job.claim(now, policy.visibility_timeout);
                },
            )?;
            // `None`: a concurrent poller claimed it first.
            if let Some(job) = job {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        for id in self.due_job_ids(CF_JOBS_PROCESSING, now, usize::MAX)? {
            let job = self.update_job(
                id,
                |job| job.is_expired(now),
                |job| job.reclaim(now, policy),
            )?;
            match job {
                Some(job) if job.status == JobStatus::Failed => report.failed += 1,
                Some(_) => report.requeued += 1,
                None => {}
            }
        }
        Ok(report)
    }

    async fn complete(&self, id: Uuid, claim_token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let job = self.update_job(id, |job| job.holds_claim(claim_token), |job| job.complete(now))?;
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
        let job = self.update_job(
            id,
            |job| job.holds_claim(claim_token),
            |job| job.fail_attempt(error, retry_at, now),
        )?;
        Ok(job.is_some())
    }

    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let job = self.update_job(
            id,
            |job| job.status == JobStatus::Failed,
            |job| {
                job.requeue(now);
            },
        )?;
        Ok(job.is_some())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.get_json(CF_JOBS, id.as_bytes())
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let limit = if filter.limit == 0 {
            usize::MAX
        } else {
            filter.limit
        };
        let mut jobs: Vec<Job> = self
            .all_jobs()?
            .into_iter()
            .filter(|job| filter.org_id.as_deref().is_none_or(|org| job.org_id == org))
            .filter(|job| filter.status.is_none_or(|status| job.status == status))
            .collect();
        jobs.sort_by_key(|job| job.enqueued_at);
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[async_trait]
impl LedgerStore for RocksDbStore {
    async fn applied_record(
        &self,
        org_id: &str,
        key: &NaturalKey,
    ) -> Result<Option<AppliedEventRecord>> {
        self.get_json(CF_APPLIED, &applied_key(org_id, key))
    }

    async fn commit(
        &self,
        ctx: &TrustedContext,
        event: &CanonicalEvent,
        now: DateTime<Utc>,
    ) -> Result<CommitResult> {
        self.commit_sync(ctx, event, now)
    }

    async fn get_entity(&self, org_id: &str, entity: &EntityRef) -> Result<Option<LedgerEntity>> {
        self.get_json(CF_ENTITIES, &entity_key(org_id, entity))
    }

    async fn list_entities(
        &self,
        org_id: &str,
        kind: EntityKind,
        after: Option<&EntityRef>,
        limit: usize,
    ) -> Result<Vec<LedgerEntity>> {
        let prefix = format!("{org_id}{SEP}{}{SEP}", kind.as_str());
        let after = after.map(|entity| entity_key(org_id, entity));
        self.scan_prefix_after(CF_ENTITIES, prefix.as_bytes(), after.as_deref(), limit)
    }

    async fn count_applied(&self, org_id: &str) -> Result<usize> {
        let records: Vec<AppliedEventRecord> =
            self.scan_prefix(CF_APPLIED, &prefixed(org_id, ""), usize::MAX)?;
        Ok(records.len())
    }

    async fn org_ids(&self) -> Result<Vec<String>> {
        let cf = self.cf(CF_ENTITIES)?;
        let mut orgs = BTreeSet::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some((org, _)) = key.split_once(SEP) {
                orgs.insert(org.to_string());
            }
        }
        Ok(orgs.into_iter().collect())
    }
}

#[async_trait]
impl AnomalyStore for RocksDbStore {
    async fn upsert_open(
        &self,
        ctx: &TrustedContext,
        finding: Finding,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        self.upsert_open_sync(ctx, finding, now)
    }

    async fn resolve_open(
        &self,
        ctx: &TrustedContext,
        org_id: &str,
        detector: &str,
        entity: &EntityRef,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.resolve_open_sync(ctx, org_id, detector, entity, now)
    }

    async fn list_open(&self, org_id: &str, detector: &str) -> Result<Vec<AnomalyRecord>> {
        let records: Vec<AnomalyRecord> =
            self.scan_prefix(CF_ANOMALIES, &prefixed(org_id, ""), usize::MAX)?;
        Ok(records
            .into_iter()
            .filter(|r| r.is_open() && r.detector == detector)
            .collect())
    }

    async fn list(&self, org_id: &str, include_resolved: bool) -> Result<Vec<AnomalyRecord>> {
        let mut records: Vec<AnomalyRecord> =
            self.scan_prefix(CF_ANOMALIES, &prefixed(org_id, ""), usize::MAX)?;
        records.retain(|r| include_resolved || r.is_open());
        records.sort_by_key(|r| r.detected_at);
        Ok(records)
    }
}

fn prefixed(org_id: &str, rest: &str) -> Vec<u8> {
    format!("{org_id}{SEP}{rest}").into_bytes()
}

fn applied_key(org_id: &str, key: &NaturalKey) -> Vec<u8> {
    prefixed(org_id, key.as_str())
}

fn entity_key(org_id: &str, entity: &EntityRef) -> Vec<u8> {
    format!(
        "{org_id}{SEP}{}{SEP}{}{SEP}{}",
        entity.kind.as_str(),
        entity.provider,
        entity.id
    )
    .into_bytes()
}

/// Big-endian microseconds with the sign bit flipped, so byte order is
/// time order.
fn time_key(at: DateTime<Utc>) -> [u8; 8] {
    ((at.timestamp_micros() as u64) ^ (1 << 63)).to_be_bytes()
}

/// Index rows a job occupies in its current status.
fn job_index_entries(job: &Job) -> Vec<(&'static str, Vec<u8>)> {
    let mut entries = Vec::new();
    if let Some(at) = job.ready_at() {
        let mut key = time_key(at).to_vec();
        key.extend_from_slice(&time_key(job.enqueued_at));
        key.extend_from_slice(job.id.as_bytes());
        entries.push((CF_JOBS_READY, key));
    }
    if let Some(at) = job.expires_at() {
        let mut key = time_key(at).to_vec();
        key.extend_from_slice(job.id.as_bytes());
        entries.push((CF_JOBS_PROCESSING, key));
    }
    entries
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        PaymentError::InternalError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Deserialization error: {}", e),
        )))
    })
}

fn is_conflict(err: &rocksdb::Error) -> bool {
    matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}
