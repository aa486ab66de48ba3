use super::AppState;
use crate::application::consistency::DetectorRunner;
use crate::application::engine::EventApplicationEngine;
use crate::application::handlers::{
    ApplyEventHandler, ConsistencyRunHandler, JobDispatcher, JobHandlerRef, NormalizeEventHandler,
    NullProviderApi, SyncProviderHandler,
};
use crate::application::ingest::IngestionService;
use crate::application::replay::ReplayService;
use crate::application::worker::QueueWorker;
use crate::config::Config;
use crate::connectors::registry::ConnectorRegistry;
use crate::domain::job::JobType;
use crate::domain::ports::{AuditLogRef, ProjectDirectoryRef, ProviderApiRef};
use crate::domain::project::ProjectBinding;
use crate::error::Result;
use crate::infrastructure::Stores;
use crate::infrastructure::in_memory::{
    InMemoryAuditLog, InMemoryProjectDirectory, StaticOperatorAuthenticator,
};
use std::fmt;
use std::sync::Arc;

/// Assembles services, job handlers and stores into an [`AppState`].
///
/// Defaults to in-memory stores, no project bindings, an in-memory audit
/// log and a provider API that never finds missed deliveries.
pub struct AppStateBuilder {
    config: Config,
    stores: Stores,
    bindings: Vec<ProjectBinding>,
    registry: Arc<ConnectorRegistry>,
    provider_api: ProviderApiRef,
    audit: AuditLogRef,
    copilot: Option<JobHandlerRef>,
}

impl fmt::Debug for AppStateBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppStateBuilder")
            .field("config", &self.config)
            .field("bindings", &self.bindings.len())
            .field("copilot", &self.copilot.is_some())
            .finish_non_exhaustive()
    }
}

impl AppStateBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stores: Stores::in_memory(),
            bindings: Vec::new(),
            registry: Arc::new(ConnectorRegistry::new()),
            provider_api: Arc::new(NullProviderApi),
            audit: Arc::new(InMemoryAuditLog::new()),
            copilot: None,
        }
    }

    #[must_use]
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = stores;
        self
    }

    #[must_use]
    pub fn bindings(mut self, bindings: Vec<ProjectBinding>) -> Self {
        self.bindings = bindings;
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    #[must_use]
    pub fn provider_api(mut self, api: ProviderApiRef) -> Self {
        self.provider_api = api;
        self
    }

    #[must_use]
    pub fn audit_log(mut self, audit: AuditLogRef) -> Self {
        self.audit = audit;
        self
    }

    /// Handler for `copilot_run` jobs. Without one those jobs fail terminally.
    #[must_use]
    pub fn copilot_handler(mut self, handler: JobHandlerRef) -> Self {
        self.copilot = Some(handler);
        self
    }

    /// # Errors
    ///
    /// `ValidationError` when two bindings share a webhook key.
    pub fn build(self) -> Result<AppState> {
        let Self {
            config,
            stores,
            bindings,
            registry,
            provider_api,
            audit,
            copilot,
        } = self;

        let directory: ProjectDirectoryRef = Arc::new(InMemoryProjectDirectory::new(bindings)?);
        let ingestion = Arc::new(IngestionService::new(
            registry.clone(),
            directory.clone(),
            stores.raw_events.clone(),
            stores.queue.clone(),
        ));
        let detectors = Arc::new(
            DetectorRunner::new(
                stores.ledger.clone(),
                stores.anomalies.clone(),
                config.detector_batch_limit,
            )
            .with_default_detectors(config.detector_grace),
        );

        let mut dispatcher = JobDispatcher::new()
            .register(
                JobType::NormalizeEvent,
                Arc::new(NormalizeEventHandler::new(
                    registry.clone(),
                    stores.raw_events.clone(),
                    stores.queue.clone(),
                )),
            )
            .register(
                JobType::ApplyEvent,
                Arc::new(ApplyEventHandler::new(EventApplicationEngine::new(
                    stores.ledger.clone(),
                ))),
            )
            .register(
                JobType::ConsistencyRun,
                Arc::new(ConsistencyRunHandler::new(detectors.clone())),
            )
            .register(
                JobType::SyncProvider,
                Arc::new(SyncProviderHandler::new(
                    registry.clone(),
                    directory,
                    provider_api,
                    ingestion.clone(),
                )),
            );
        if let Some(handler) = copilot {
            dispatcher = dispatcher.register(JobType::CopilotRun, handler);
        }

        let worker = Arc::new(QueueWorker::new(
            stores.queue.clone(),
            Arc::new(dispatcher),
            config.worker,
        ));
        let replay = Arc::new(
            ReplayService::new(
                registry,
                stores.raw_events.clone(),
                EventApplicationEngine::new(stores.ledger.clone()),
                audit,
            )
            .require_audit(config.require_audit),
        );

        Ok(AppState {
            ingestion,
            worker,
            detectors,
            replay,
            queue: stores.queue,
            anomalies: stores.anomalies,
            operators: Arc::new(StaticOperatorAuthenticator::new(config.operators)),
            internal_secret: Arc::from(config.internal_api_secret.as_str()),
            max_payload_bytes: config.max_payload_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ProviderKey;

    fn config() -> Config {
        Config::from_lookup(|key: &str| {
            (key == crate::config::ENV_INTERNAL_API_SECRET).then(|| "s3cret".to_string())
        })
        .unwrap()
    }

    fn binding(key: &str) -> ProjectBinding {
        ProjectBinding {
            webhook_key: key.into(),
            org_id: "org_1".into(),
            project_id: "proj_1".into(),
            provider: ProviderKey::Stripe,
            signing_secret: "whsec".into(),
        }
    }

    #[test]
    fn test_build_carries_config() {
        let state = AppStateBuilder::new(config()).build().unwrap();
        assert_eq!(&*state.internal_secret, "s3cret");
        assert_eq!(state.max_payload_bytes, 1024 * 1024);
    }

    #[test]
    fn test_internal_context_requires_the_secret() {
        let state = AppStateBuilder::new(config()).build().unwrap();
        assert!(state.internal_context("wrong", "worker").is_none());
        let ctx = state.internal_context("s3cret", "worker").unwrap();
        assert_eq!(ctx.principal().to_string(), "internal:worker");
    }

    #[test]
    fn test_duplicate_webhook_keys_rejected() {
        let err = AppStateBuilder::new(config())
            .bindings(vec![binding("wh_1"), binding("wh_1")])
            .build()
            .err().unwrap();
        assert!(matches!(err, crate::error::PaymentError::ValidationError(_)));
    }
}
