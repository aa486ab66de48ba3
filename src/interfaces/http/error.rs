use crate::error::PaymentError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// HTTP face of [`PaymentError`].
///
/// Server-side failures are logged in full and answered with a generic
/// message; client errors echo the reason.
#[derive(Debug)]
pub struct ApiError(pub PaymentError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PaymentError::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
            PaymentError::Forbidden(_) => StatusCode::FORBIDDEN,
            PaymentError::NotFound(_) | PaymentError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            PaymentError::ValidationError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PaymentError> for ApiError {
    fn from(error: PaymentError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self.0, "request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (PaymentError::AuthenticationFailure("sig".into()), 401),
            (PaymentError::Forbidden("org".into()), 403),
            (PaymentError::UnknownProvider("paypal".into()), 404),
            (PaymentError::NotFound("key".into()), 404),
            (PaymentError::ValidationError("field".into()), 400),
            (PaymentError::Configuration("secret".into()), 500),
            (PaymentError::TransientStorage("busy".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status().as_u16(), status);
        }
    }

    #[test]
    fn test_server_errors_hide_details() {
        let response = ApiError(PaymentError::Configuration("whsec missing".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
