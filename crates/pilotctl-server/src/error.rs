use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pilotctl_crypto::{CryptoError, KeyKind};
use serde_json::json;
use tracing::{error, warn};

use crate::auth::AuthError;
use crate::storage::StoreError;

/// Service error wrapper that maps to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServiceError::Auth(AuthError::StoreUnavailable { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "admission check unavailable")
            }
            ServiceError::Auth(_) => (StatusCode::UNAUTHORIZED, "authentication failed"),
            ServiceError::Crypto(CryptoError::KeyNotFound(KeyKind::Verify)) => {
                (StatusCode::NOT_FOUND, "verification key not found")
            }
            ServiceError::Crypto(_) => (StatusCode::INTERNAL_SERVER_ERROR, "cryptographic error"),
            ServiceError::Store(_) | ServiceError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        };

        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        // Callers must not learn which hosts exist or are admitted.
        let detail = match &self {
            ServiceError::Auth(e) => {
                if !status.is_server_error() {
                    warn!(error = %e, "request rejected");
                }
                message.to_string()
            }
            _ => self.to_string(),
        };

        let body = json!({
            "error": message,
            "detail": detail,
        });

        (status, axum::Json(body)).into_response()
    }
}
