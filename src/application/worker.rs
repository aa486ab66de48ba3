//! Drains due jobs from the queue.
//!
//! The worker never schedules itself: each call to [`QueueWorker::run_once`]
//! is one poll triggered from outside. Overlapping invocations are safe
//! because claiming is atomic in the queue.

use super::handlers::JobDispatcher;
use crate::domain::context::TrustedContext;
use crate::domain::job::{Job, RetryPolicy};
use crate::domain::ports::JobQueueRef;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Upper bound on jobs claimed per poll, whatever the configuration says.
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    /// Organizations processed at the same time. Jobs of one organization
    /// always run one after another.
    pub parallel_orgs: usize,
    pub policy: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            parallel_orgs: 4,
            policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub claimed: usize,
    /// Jobs completed successfully.
    pub processed: usize,
    /// Jobs that reached `failed` during this poll.
    pub failed: usize,
    /// Jobs that failed an attempt and were re-queued with backoff.
    pub retried: usize,
    /// Expired claims returned to the queue before claiming.
    pub reclaimed: usize,
    /// Jobs whose outcome could not be recorded because the claim was lost.
    pub abandoned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Retried,
    Failed,
    Abandoned,
}

impl WorkerReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.processed += 1,
            JobOutcome::Retried => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

pub struct QueueWorker {
    queue: JobQueueRef,
    dispatcher: Arc<JobDispatcher>,
    settings: WorkerSettings,
}

impl QueueWorker {
    pub fn new(queue: JobQueueRef, dispatcher: Arc<JobDispatcher>, settings: WorkerSettings) -> Self {
        Self {
            queue,
            dispatcher,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub async fn run_once(&self, ctx: &TrustedContext) -> Result<WorkerReport> {
        self.run_once_at(ctx, Utc::now()).await
    }

    /// One poll: reclaim expired claims, claim a bounded batch and run it.
    #[tracing::instrument(skip_all)]
    pub async fn run_once_at(&self, ctx: &TrustedContext, now: DateTime<Utc>) -> Result<WorkerReport> {
        let policy = self.settings.policy;
        let mut report = WorkerReport::default();

        let reclaim = self.queue.reclaim_expired(now, &policy).await?;
        report.reclaimed = reclaim.requeued;
        report.failed += reclaim.failed;
        if reclaim.requeued + reclaim.failed > 0 {
            warn!(
                requeued = reclaim.requeued,
                failed = reclaim.failed,
                "reclaimed jobs whose visibility timeout elapsed"
            );
        }

        let limit = self.settings.batch_size.clamp(1, MAX_BATCH_SIZE);
        let jobs = self.queue.claim_batch(limit, now, &policy).await?;
        report.claimed = jobs.len();
        if jobs.is_empty() {
            return Ok(report);
        }

        let mut by_org: BTreeMap<String, Vec<Job>> = BTreeMap::new();
        for job in jobs {
            by_org.entry(job.org_id.clone()).or_default().push(job);
        }

        let permits = Arc::new(Semaphore::new(self.settings.parallel_orgs.max(1)));
        let mut tasks = JoinSet::new();
        for (org_id, jobs) in by_org {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| PaymentError::internal(e.to_string()))?;
            let queue = self.queue.clone();
            let dispatcher = self.dispatcher.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let mut outcomes = Vec::with_capacity(jobs.len());
                for job in jobs {
                    let outcome = process_job(&queue, &dispatcher, &ctx, job, now, &policy).await;
                    outcomes.push(outcome);
                }
                (org_id, outcomes)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, outcomes)) => outcomes.into_iter().for_each(|o| report.record(o)),
                // Jobs of this org stay `processing` until their claim expires.
                Err(e) => error!(error = %e, "organization task aborted"),
            }
        }

        info!(
            claimed = report.claimed,
            processed = report.processed,
            failed = report.failed,
            retried = report.retried,
            "worker poll finished"
        );
        Ok(report)
    }
}

async fn process_job(
    queue: &JobQueueRef,
    dispatcher: &Arc<JobDispatcher>,
    ctx: &TrustedContext,
    job: Job,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> JobOutcome {
    let Some(token) = job.claim_token else {
        warn!(job_id = %job.id, "claimed job carries no claim token");
        return JobOutcome::Abandoned;
    };
    let job_id = job.id;
    let job_type = job.job_type;
    let attempts = job.attempts;

    // Each handler runs in its own task so a panic fails only this job.
    let handle = {
        let dispatcher = dispatcher.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { dispatcher.dispatch(&ctx, &job, now).await })
    };
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(PaymentError::internal(format!("handler aborted: {e}"))),
    };

    match result {
        Ok(()) => match queue.complete(job_id, token, now).await {
            Ok(true) => JobOutcome::Completed,
            Ok(false) => {
                warn!(%job_id, "claim lost before completion was recorded");
                JobOutcome::Abandoned
            }
            Err(e) => {
                error!(%job_id, error = %e, "could not record job completion");
                JobOutcome::Abandoned
            }
        },
        Err(err) => {
            let retry_at = (err.is_retryable() && !policy.attempts_exhausted(attempts))
                .then(|| now + policy.backoff(attempts));
            let recorded = queue
                .fail_attempt(job_id, token, err.to_string(), retry_at, now)
                .await;
            match (recorded, retry_at) {
                (Ok(true), Some(at)) => {
                    warn!(%job_id, %job_type, attempts, retry_at = %at, error = %err, "job attempt failed, will retry");
                    JobOutcome::Retried
                }
                (Ok(true), None) => {
                    error!(%job_id, %job_type, attempts, error = %err, "job failed");
                    JobOutcome::Failed
                }
                (Ok(false), _) => {
                    warn!(%job_id, "claim lost before failure was recorded");
                    JobOutcome::Abandoned
                }
                (Err(e), _) => {
                    error!(%job_id, error = %e, "could not record job failure");
                    JobOutcome::Abandoned
                }
            }
        }
    }
}
