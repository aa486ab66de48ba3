use crate::connectors::{Connector, ConnectorRegistry};
use crate::domain::job::{Job, JobPayload, NewJob};
use crate::domain::ports::{JobQueueRef, ProjectDirectoryRef, RawEventStoreRef};
use crate::domain::project::ProjectBinding;
use crate::domain::raw_event::{HeaderMapping, RawEvent, WebhookEnvelope};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_ENQUEUE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub raw_event_id: Uuid,
    pub job_id: Uuid,
    pub event_type: String,
}

/// Verifies, persists and enqueues provider webhooks.
///
/// Never normalizes or applies: the only work on the request path is the
/// signature check, one insert and one enqueue.
pub struct IngestionService {
    registry: Arc<ConnectorRegistry>,
    directory: ProjectDirectoryRef,
    raw_events: RawEventStoreRef,
    queue: JobQueueRef,
    enqueue_attempts: u32,
    enqueue_backoff: Duration,
}

impl IngestionService {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        directory: ProjectDirectoryRef,
        raw_events: RawEventStoreRef,
        queue: JobQueueRef,
    ) -> Self {
        Self {
            registry,
            directory,
            raw_events,
            queue,
            enqueue_attempts: DEFAULT_ENQUEUE_ATTEMPTS,
            enqueue_backoff: Duration::from_millis(50),
        }
    }

    pub fn with_enqueue_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.enqueue_attempts = attempts.max(1);
        self.enqueue_backoff = backoff;
        self
    }

    #[tracing::instrument(skip(self, webhook_key, headers, body), fields(bytes = body.len()))]
    pub async fn ingest(
        &self,
        provider: &str,
        webhook_key: &str,
        headers: HeaderMapping,
        body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<IngestReceipt> {
        let connector = self.registry.resolve_str(provider)?;
        let binding = self
            .directory
            .resolve_webhook_key(webhook_key)
            .await?
            .filter(|b| b.provider == connector.provider())
            .ok_or_else(|| {
                PaymentError::NotFound(format!("no {provider} project for this webhook key"))
            })?;

        if binding.signing_secret.trim().is_empty() {
            error!(
                org_id = %binding.org_id,
                project_id = %binding.project_id,
                "project has no webhook signing secret configured"
            );
            return Err(PaymentError::Configuration(format!(
                "signing secret missing for project {}",
                binding.project_id
            )));
        }

        if !connector.verify_signature(&body, &headers, &binding.signing_secret) {
            warn!(org_id = %binding.org_id, "webhook signature verification failed");
            return Err(PaymentError::AuthenticationFailure(
                "invalid webhook signature".into(),
            ));
        }

        let envelope = WebhookEnvelope::new(
            binding.org_id.clone(),
            binding.project_id.clone(),
            headers,
            body,
            now,
        );
        self.persist_and_enqueue(connector, &binding, envelope, now)
            .await
    }

    /// Persists a delivery that is already trusted and enqueues its
    /// normalization. Shared by webhook ingestion and provider sync.
    pub(crate) async fn persist_and_enqueue(
        &self,
        connector: &dyn Connector,
        binding: &ProjectBinding,
        envelope: WebhookEnvelope,
        now: DateTime<Utc>,
    ) -> Result<IngestReceipt> {
        let raw = match connector.parse_webhook(envelope.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    org_id = %binding.org_id,
                    error = %e,
                    "verified webhook could not be parsed, keeping it as unparsed"
                );
                RawEvent::unparsed(connector.provider().as_str(), envelope)
            }
        };
        let raw_event_id = raw.id;
        let event_type = raw.event_type.clone();
        self.raw_events.insert(raw).await?;

        let job = NewJob::new(
            binding.org_id.clone(),
            Some(binding.project_id.clone()),
            JobPayload::NormalizeEvent { raw_event_id },
        );
        let job = self.enqueue_with_retry(job, raw_event_id, now).await?;
        info!(
            org_id = %binding.org_id,
            %raw_event_id,
            job_id = %job.id,
            event_type = %event_type,
            "webhook accepted"
        );
        Ok(IngestReceipt {
            raw_event_id,
            job_id: job.id,
            event_type,
        })
    }

    /// The raw event is already durable, so an enqueue failure never rolls
    /// it back; after the last attempt the error is logged for operators and
    /// returned so the provider redelivers.
    async fn enqueue_with_retry(
        &self,
        job: NewJob,
        raw_event_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut attempt = 1;
        loop {
            match self.queue.enqueue(job.clone(), now).await {
                Ok(job) => return Ok(job),
                Err(e) if attempt < self.enqueue_attempts => {
                    warn!(%raw_event_id, attempt, error = %e, "normalize enqueue failed, retrying");
                    tokio::time::sleep(self.enqueue_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        %raw_event_id,
                        attempts = attempt,
                        error = %e,
                        "normalize enqueue failed; raw event is persisted but not queued"
                    );
                    return Err(e);
                }
            }
        }
    }
}
