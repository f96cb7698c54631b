//! Error types for the registration service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use registration_core::{AccountError, RegistrationError, StoreError};
use serde::Serialize;
use thiserror::Error;

/// Service error types.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid phone number format: {0}")]
    InvalidPhoneNumber(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No registration is waiting for a challenge")]
    NotWaiting,

    #[error("Account service error: {0}")]
    Account(#[from] AccountError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServiceError::InvalidPhoneNumber(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_PHONE_NUMBER")
            }
            ServiceError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ServiceError::NotWaiting => (StatusCode::CONFLICT, "NOT_WAITING_FOR_CHALLENGE"),
            ServiceError::Account(_) => (StatusCode::BAD_GATEWAY, "ACCOUNT_SERVICE_ERROR"),
            ServiceError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            ServiceError::Registration(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "REGISTRATION_UNAVAILABLE")
            }
            ServiceError::RateLimitExceeded => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED")
            }
            ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_response_body() {
        let response = ServiceError::InvalidPhoneNumber("too short".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "INVALID_PHONE_NUMBER");
        assert_eq!(json["error"], "Invalid phone number format: too short");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServiceError::RateLimitExceeded.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ServiceError::NotWaiting.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::from(AccountError::RateLimited)
                .into_response()
                .status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
