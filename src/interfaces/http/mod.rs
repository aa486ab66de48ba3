//! HTTP API: public webhook ingestion, the internal worker and consistency
//! triggers, operator job/anomaly inspection and manual replay.

mod builder;
pub mod error;
mod internal;
mod ops;
mod webhooks;

use crate::application::consistency::DetectorRunner;
use crate::application::ingest::IngestionService;
use crate::application::replay::ReplayService;
use crate::application::worker::QueueWorker;
use crate::connectors::signature::constant_time_eq;
use crate::domain::context::TrustedContext;
use crate::domain::ports::{AnomalyStoreRef, JobQueueRef, OperatorAuthenticatorRef};
use crate::error::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

pub use builder::AppStateBuilder;
pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<IngestionService>,
    pub worker: Arc<QueueWorker>,
    pub detectors: Arc<DetectorRunner>,
    pub replay: Arc<ReplayService>,
    pub queue: JobQueueRef,
    pub anomalies: AnomalyStoreRef,
    pub operators: OperatorAuthenticatorRef,
    /// Shared secret expected in `Authorization: Bearer` on `/internal/*`.
    pub internal_secret: Arc<str>,
    pub max_payload_bytes: usize,
}

impl AppState {
    /// Context for a caller presenting the internal shared secret, or `None`
    /// when the secret does not match (or none is configured).
    pub fn internal_context(&self, presented: &str, component: &str) -> Option<TrustedContext> {
        let expected = self.internal_secret.as_bytes();
        if expected.is_empty() || !constant_time_eq(presented.as_bytes(), expected) {
            return None;
        }
        Some(TrustedContext::internal(component))
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_payload_bytes);
    Router::new()
        .route("/healthz", get(health))
        .route("/webhooks/{provider}", post(webhooks::receive).layer(body_limit))
        .route("/internal/worker", post(internal::run_worker))
        .route("/internal/consistency", post(internal::run_consistency))
        .route("/internal/jobs", get(internal::list_jobs))
        .route("/internal/jobs/{id}/requeue", post(internal::requeue_job))
        .route("/internal/anomalies", get(internal::list_anomalies))
        .route("/ops/replay", post(ops::replay))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
