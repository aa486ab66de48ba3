use super::{ApiError, AppState, bearer_token};
use crate::application::replay::{ReplayReport, ReplayRequest};
use crate::error::PaymentError;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;

/// `POST /ops/replay` with `{orgId, provider, eventId}`.
///
/// The body is decoded by hand so malformed JSON is a 400 like any other
/// missing field.
pub(super) async fn replay(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReplayReport>, ApiError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| PaymentError::AuthenticationFailure("missing bearer token".into()))?;
    let operator = state
        .operators
        .authenticate(token)
        .await?
        .ok_or_else(|| PaymentError::AuthenticationFailure("unknown operator".into()))?;

    let request: ReplayRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ReplayRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| PaymentError::ValidationError(format!("invalid replay request: {e}")))?
    };
    let report = state.replay.replay(&operator, request, Utc::now()).await?;
    Ok(Json(report))
}
