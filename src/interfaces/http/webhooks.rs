use super::{ApiError, AppState};
use crate::application::ingest::IngestReceipt;
use crate::domain::raw_event::HeaderMapping;
use crate::error::PaymentError;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(super) struct WebhookQuery {
    key: Option<String>,
}

/// `POST /webhooks/{provider}?key={webhook key}`
pub(super) async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestReceipt>, ApiError> {
    let key = query
        .key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| PaymentError::NotFound("missing webhook key".into()))?;
    let receipt = state
        .ingestion
        .ingest(
            &provider,
            &key,
            header_mapping(&headers),
            body.to_vec(),
            Utc::now(),
        )
        .await?;
    Ok(Json(receipt))
}

/// Header names come lower-cased from `http`; values that are not visible
/// ASCII are dropped.
fn header_mapping(headers: &HeaderMap) -> HeaderMapping {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
