//! HTTP error rendering
//!
//! Maps the core error taxonomy to HTTP statuses and `{"error": ...}`
//! bodies. Internal errors never leak detail into the response.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use wharf_common::Error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Newtype so the core error can implement axum's response trait.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::PermissionDenied(_) | Error::Banned => StatusCode::FORBIDDEN,
        Error::Unauthorized(_) | Error::TwoFactorRequired(_) => StatusCode::UNAUTHORIZED,
        Error::PasscodeRequired
        | Error::PasscodeInvalid
        | Error::PasscodeAlreadyUsed
        | Error::RecoveryCodeAlreadyUsed => StatusCode::BAD_REQUEST,
        Error::QuotaExceeded(_) | Error::TransferQuotaExceeded(_) => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        Error::TooManySessions(_) | Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::OperationUnsupported(_) => StatusCode::NOT_IMPLEMENTED,
        Error::Stale(_) => StatusCode::CONFLICT,
        Error::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        // A cancelled request has no meaningful status; the body is
        // aborted by the handler, this is a fallback.
        Error::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Referenced(_) => StatusCode::BAD_REQUEST,
        Error::CryptoIntegrityError(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let message = match &self.0 {
            // No internal detail on the wire
            Error::Internal(_) => "internal error".to_string(),
            Error::CryptoIntegrityError(_) => "crypto error".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), "request failed: {}", self.0);
        } else {
            tracing::debug!(kind = self.0.kind(), "request rejected: {}", self.0);
        }
        let mut response = (status, Json(ErrorBody { error: message })).into_response();
        match &self.0 {
            Error::Unauthorized(_) | Error::TwoFactorRequired(_) => {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    header::HeaderValue::from_static("Bearer"),
                );
            }
            Error::RateLimited { retry_after_secs } => {
                if let Ok(value) = header::HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            _ => {}
        }
        response
    }
}

/// Shorthand for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(&Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&Error::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::QuotaExceeded("x".into())),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&Error::TooManySessions("x".into())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(&Error::Banned), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&Error::Internal("secret detail".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
