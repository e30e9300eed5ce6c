use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::credits::LedgerError;
use crate::providers::ProviderError;
use crate::tasks::store::StoreError;
use crate::tasks::submission::SubmitError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    /// Stable machine-readable code returned beside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Submit(err) => match err {
                SubmitError::ModelNotFound(_) => "MODEL_NOT_FOUND",
                SubmitError::InvalidParams(_)
                | SubmitError::Provider(ProviderError::InvalidParams(_)) => "INVALID_PARAMS",
                SubmitError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
                SubmitError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
                SubmitError::ProviderUnavailable(_) | SubmitError::Provider(_) => {
                    "GENERATION_FAILED"
                }
                SubmitError::Store(_) | SubmitError::Ledger(_) => "INTERNAL_ERROR",
            },
            AppError::NotFound => "NOT_FOUND",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::BadRequest(_) => "INVALID_PARAMS",
            AppError::Store(_) | AppError::Ledger(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Submit(err) => match err {
                SubmitError::ModelNotFound(_)
                | SubmitError::InvalidParams(_)
                | SubmitError::Provider(ProviderError::InvalidParams(_)) => StatusCode::BAD_REQUEST,
                SubmitError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
                SubmitError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                SubmitError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                SubmitError::Provider(_) => StatusCode::BAD_GATEWAY,
                SubmitError::Store(_) | SubmitError::Ledger(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Store(_) | AppError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        let body = json!({ "code": self.code(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_errors_map_to_distinct_codes() {
        let cases = [
            (
                AppError::from(SubmitError::InsufficientCredits {
                    required: 600,
                    available: 100,
                }),
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_CREDITS",
            ),
            (
                AppError::from(SubmitError::RateLimitExceeded { limit: 3 }),
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
            ),
            (
                AppError::from(SubmitError::ModelNotFound("nope".into())),
                StatusCode::BAD_REQUEST,
                "MODEL_NOT_FOUND",
            ),
            (
                AppError::from(SubmitError::Provider(ProviderError::Rejected {
                    status: 500,
                    body: "boom".into(),
                })),
                StatusCode::BAD_GATEWAY,
                "GENERATION_FAILED",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }
}
