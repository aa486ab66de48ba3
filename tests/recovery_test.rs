mod common;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use common::*;
use payrail::domain::job::{Job, JobPayload, JobStatus, NewJob, RetryPolicy};
use payrail::domain::ports::{JobFilter, JobQueue, ReclaimReport};
use payrail::error::{PaymentError, Result};
use payrail::infrastructure::Stores;
use payrail::infrastructure::in_memory::InMemoryJobQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

#[tokio::test]
async fn test_crashed_claim_is_reclaimed_and_finished_once() {
    let app = TestApp::new();
    let ctx = app.internal_context();
    let policy = app.state.worker.settings().policy;
    app.send(stripe_delivery(
        STRIPE_KEY,
        stripe_payment_settled("evt_1", "p_123", 10000, None),
    ))
    .await;

    // A worker claims the job and dies without reporting.
    let now = Utc::now();
    let crashed = app.stores.queue.claim_batch(10, now, &policy).await.unwrap();
    assert_eq!(crashed.len(), 1);
    let stale_token = crashed[0].claim_token.unwrap();

    // Nothing is claimable until the visibility timeout passes.
    let early = app.state.worker.run_once_at(&ctx, now).await.unwrap();
    assert_eq!((early.claimed, early.reclaimed), (0, 0));

    let later = now + policy.visibility_timeout + Duration::seconds(1);
    let report = app.state.worker.run_once_at(&ctx, later).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.processed, 1);

    let job = app.stores.queue.get(crashed[0].id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);

    // The original worker resumes and tries to report: it no longer owns the job.
    assert!(
        !app.stores
            .queue
            .complete(job.id, stale_token, later)
            .await
            .unwrap()
    );

    let report = app.state.worker.run_once_at(&ctx, later).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(app.stores.ledger.count_applied(ORG).await.unwrap(), 1);
}

#[tokio::test]
async fn test_sync_job_crash_returns_to_queue_and_completes() {
    let app = TestApp::new();
    let ctx = app.internal_context();
    let policy = app.state.worker.settings().policy;
    let now = Utc::now();
    let job = app
        .stores
        .queue
        .enqueue(
            NewJob::new(
                ORG,
                None,
                JobPayload::SyncProvider {
                    provider: "stripe".into(),
                    since: None,
                },
            ),
            now,
        )
        .await
        .unwrap();

    let claimed = app.stores.queue.claim_batch(10, now, &policy).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let later = now + policy.visibility_timeout + Duration::seconds(1);
    let reclaimed = app
        .stores
        .queue
        .reclaim_expired(later, &policy)
        .await
        .unwrap();
    assert_eq!(reclaimed.requeued, 1);
    let requeued = app.stores.queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);

    let report = app.state.worker.run_once_at(&ctx, later).await.unwrap();
    assert_eq!(report.processed, 1);
    let done = app.stores.queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

/// Queue whose first `failures` enqueues fail with a transient error.
struct FlakyQueue {
    inner: InMemoryJobQueue,
    failures: AtomicUsize,
}

impl FlakyQueue {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryJobQueue::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PaymentError::TransientStorage("queue unavailable".into()));
        }
        self.inner.enqueue(job, now).await
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Vec<Job>> {
        self.inner.claim_batch(limit, now, policy).await
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<ReclaimReport> {
        self.inner.reclaim_expired(now, policy).await
    }

    async fn complete(&self, id: Uuid, claim_token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.inner.complete(id, claim_token, now).await
    }

    async fn fail_attempt(
        &self,
        id: Uuid,
        claim_token: Uuid,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner
            .fail_attempt(id, claim_token, error, retry_at, now)
            .await
    }

    async fn requeue_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.inner.requeue_failed(id, now).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.inner.get(id).await
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.inner.list(filter).await
    }
}

fn stores_with(queue: FlakyQueue) -> Stores {
    Stores {
        queue: Arc::new(queue),
        ..Stores::in_memory()
    }
}

#[tokio::test]
async fn test_enqueue_is_retried_within_the_request() {
    let app = TestApp::with(&[], stores_with(FlakyQueue::new(2)));
    let (status, _) = app
        .send(stripe_delivery(
            STRIPE_KEY,
            stripe_payment_settled("evt_1", "p_1", 4200, None),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    app.drain().await;
    assert_eq!(app.stores.ledger.count_applied(ORG).await.unwrap(), 1);
}

#[tokio::test]
async fn test_enqueue_failure_keeps_raw_event_and_redelivery_recovers() {
    let app = TestApp::with(&[], stores_with(FlakyQueue::new(3)));
    let body = stripe_payment_settled("evt_1", "p_1", 4200, None);

    let (status, error) = app.send(stripe_delivery(STRIPE_KEY, body.clone())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error["error"], "internal error");
    assert_eq!(app.stores.raw_events.count(ORG).await.unwrap(), 1);
    let jobs = app.stores.queue.list(JobFilter { limit: 10, ..JobFilter::default() }).await.unwrap();
    assert!(jobs.is_empty());

    // The provider redelivers; the fact is applied exactly once.
    let (status, _) = app.send(stripe_delivery(STRIPE_KEY, body)).await;
    assert_eq!(status, StatusCode::OK);
    app.drain().await;
    assert_eq!(app.stores.raw_events.count(ORG).await.unwrap(), 2);
    assert_eq!(app.stores.ledger.count_applied(ORG).await.unwrap(), 1);
}
