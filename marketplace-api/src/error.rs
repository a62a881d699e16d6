use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use escrow_engine::error::{EscrowError, GatewayError};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorPayload,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Error returned by every handler
#[derive(Debug)]
pub enum ApiError {
    /// No usable caller identity on the request
    Unauthenticated,
    Escrow(EscrowError),
}

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        Self::Escrow(err)
    }
}

fn status_for(err: &EscrowError) -> StatusCode {
    match err {
        EscrowError::Validation(_) => StatusCode::BAD_REQUEST,
        EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
        EscrowError::Authorization(_) => StatusCode::FORBIDDEN,
        EscrowError::Gateway(GatewayError::SessionNotReady(_)) => StatusCode::PAYMENT_REQUIRED,
        EscrowError::Gateway(GatewayError::NotConfigured) | EscrowError::Config(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EscrowError::Gateway(_) => StatusCode::BAD_GATEWAY,
        EscrowError::InvalidState { .. } | EscrowError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                "Missing or invalid X-User-Id header".to_string(),
            ),
            ApiError::Escrow(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!("request failed: {}", err);
                }
                // internal details stay in the logs
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "Internal server error".to_string()
                } else {
                    err.to_string()
                };
                (status, err.code(), message)
            }
        };

        let body = ErrorEnvelope {
            error: ErrorPayload {
                code: code.to_string(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
