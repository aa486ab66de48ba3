//! Job handlers, one per job type, and the dispatcher the worker calls.

use super::consistency::DetectorRunner;
use super::engine::EventApplicationEngine;
use super::ingest::IngestionService;
use crate::connectors::{ConnectorRegistry, ProviderKey};
use crate::domain::context::TrustedContext;
use crate::domain::job::{Job, JobPayload, JobType, NewJob};
use crate::domain::ports::{
    FetchedWebhook, JobQueueRef, ProjectDirectoryRef, ProviderApi, ProviderApiRef,
    RawEventStoreRef,
};
use crate::domain::project::ProjectBinding;
use crate::domain::raw_event::WebhookEnvelope;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &TrustedContext, job: &Job, now: DateTime<Utc>) -> Result<()>;
}

pub type JobHandlerRef = Arc<dyn JobHandler>;

/// Routes a claimed job to the handler registered for its type.
#[derive(Default, Clone)]
pub struct JobDispatcher {
    handlers: HashMap<JobType, JobHandlerRef>,
}

impl JobDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: JobType, handler: JobHandlerRef) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn handles(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// A job type with no registered handler is a deployment problem, not a
    /// transient one, so it fails the job terminally.
    pub async fn dispatch(
        &self,
        ctx: &TrustedContext,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let handler = self.handlers.get(&job.job_type).ok_or_else(|| {
            PaymentError::Configuration(format!("no handler registered for {} jobs", job.job_type))
        })?;
        if job.payload.job_type() != job.job_type {
            return Err(PaymentError::ValidationError(format!(
                "job {} is typed {} but carries a {} payload",
                job.id,
                job.job_type,
                job.payload.job_type()
            )));
        }
        handler.handle(ctx, job, now).await
    }
}

/// `normalize_event`: raw event -> canonical events -> `apply_event` job.
pub struct NormalizeEventHandler {
    registry: Arc<ConnectorRegistry>,
    raw_events: RawEventStoreRef,
    queue: JobQueueRef,
}

impl NormalizeEventHandler {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        raw_events: RawEventStoreRef,
        queue: JobQueueRef,
    ) -> Self {
        Self {
            registry,
            raw_events,
            queue,
        }
    }
}

#[async_trait]
impl JobHandler for NormalizeEventHandler {
    #[tracing::instrument(skip_all, fields(job_id = %job.id, org_id = %job.org_id))]
    async fn handle(&self, _ctx: &TrustedContext, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let JobPayload::NormalizeEvent { raw_event_id } = &job.payload else {
            return Err(unexpected_payload(job));
        };
        let raw = self
            .raw_events
            .get(&job.org_id, *raw_event_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("raw event {raw_event_id}")))?;
        if raw.is_unparsed() {
            return Err(PaymentError::MalformedPayload(format!(
                "raw event {} could not be parsed at ingestion",
                raw.id
            )));
        }

        let connector = self.registry.resolve_str(&raw.provider)?;
        let events = connector.normalize(&raw)?;
        if events.is_empty() {
            debug!(event_type = %raw.event_type, "no canonical events for this payload");
            return Ok(());
        }

        let count = events.len();
        let apply = self
            .queue
            .enqueue(
                NewJob::new(
                    job.org_id.clone(),
                    job.project_id.clone(),
                    JobPayload::ApplyEvent {
                        raw_event_id: Some(raw.id),
                        events,
                    },
                ),
                now,
            )
            .await?;
        info!(events = count, apply_job_id = %apply.id, "normalized");
        Ok(())
    }
}

/// `apply_event`: commits canonical events through the engine.
pub struct ApplyEventHandler {
    engine: EventApplicationEngine,
}

impl ApplyEventHandler {
    pub fn new(engine: EventApplicationEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for ApplyEventHandler {
    #[tracing::instrument(skip_all, fields(job_id = %job.id, org_id = %job.org_id))]
    async fn handle(&self, ctx: &TrustedContext, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let JobPayload::ApplyEvent { events, .. } = &job.payload else {
            return Err(unexpected_payload(job));
        };
        // A job may only touch the organization it was enqueued for.
        if let Some(foreign) = events.iter().find(|e| e.org_id != job.org_id) {
            return Err(PaymentError::ValidationError(format!(
                "event {} belongs to org {}, not {}",
                foreign.natural_key, foreign.org_id, job.org_id
            )));
        }
        let report = self.engine.apply_batch(ctx, events.clone(), now).await?;
        info!(
            applied = report.applied,
            skipped = report.skipped,
            conflicts = report.conflicts,
            "events applied"
        );
        Ok(())
    }
}

/// `consistency_run`: runs detectors for the job's organization.
pub struct ConsistencyRunHandler {
    runner: Arc<DetectorRunner>,
}

impl ConsistencyRunHandler {
    pub fn new(runner: Arc<DetectorRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl JobHandler for ConsistencyRunHandler {
    async fn handle(&self, ctx: &TrustedContext, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let JobPayload::ConsistencyRun { detectors } = &job.payload else {
            return Err(unexpected_payload(job));
        };
        let report = self
            .runner
            .run(ctx, Some(vec![job.org_id.clone()]), detectors, now)
            .await?;
        if report.errors.is_empty() {
            return Ok(());
        }
        let summary = report
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.detector, e.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(PaymentError::internal(summary))
    }
}

/// `sync_provider`: pulls deliveries we missed and feeds them through the
/// same persist-and-enqueue path as live webhooks.
pub struct SyncProviderHandler {
    registry: Arc<ConnectorRegistry>,
    directory: ProjectDirectoryRef,
    api: ProviderApiRef,
    ingestion: Arc<IngestionService>,
}

impl SyncProviderHandler {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        directory: ProjectDirectoryRef,
        api: ProviderApiRef,
        ingestion: Arc<IngestionService>,
    ) -> Self {
        Self {
            registry,
            directory,
            api,
            ingestion,
        }
    }
}

#[async_trait]
impl JobHandler for SyncProviderHandler {
    #[tracing::instrument(skip_all, fields(job_id = %job.id, org_id = %job.org_id))]
    async fn handle(&self, _ctx: &TrustedContext, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let JobPayload::SyncProvider { provider, since } = &job.payload else {
            return Err(unexpected_payload(job));
        };
        let provider: ProviderKey = provider.parse()?;
        let connector = self.registry.resolve(provider);
        let bindings: Vec<ProjectBinding> = self
            .directory
            .bindings_for(&job.org_id, provider)
            .await?
            .into_iter()
            .filter(|b| job.project_id.as_ref().is_none_or(|p| &b.project_id == p))
            .collect();

        let mut recovered = 0;
        for binding in &bindings {
            for fetched in self.api.fetch_missed(binding, *since).await? {
                let envelope = WebhookEnvelope::new(
                    binding.org_id.clone(),
                    binding.project_id.clone(),
                    fetched.headers,
                    fetched.body,
                    fetched.received_at,
                );
                self.ingestion
                    .persist_and_enqueue(connector, binding, envelope, now)
                    .await?;
                recovered += 1;
            }
        }
        info!(%provider, projects = bindings.len(), recovered, "provider sync finished");
        Ok(())
    }
}

/// Provider API that never reports missed deliveries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProviderApi;

#[async_trait]
impl ProviderApi for NullProviderApi {
    async fn fetch_missed(
        &self,
        _binding: &ProjectBinding,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedWebhook>> {
        Ok(Vec::new())
    }
}

fn unexpected_payload(job: &Job) -> PaymentError {
    PaymentError::ValidationError(format!(
        "job {} has an unexpected payload for {}",
        job.id, job.job_type
    ))
}
