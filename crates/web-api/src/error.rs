use application::{ApplicationError, RepositoryError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::DomainError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        let message = error.to_string();
        match error {
            DomainError::ValidationError { .. } => ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message),
            DomainError::Conflict { .. } => ApiError::new(StatusCode::CONFLICT, "CONFLICT", message),
            DomainError::ResourceNotFound { .. } => ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
            DomainError::InvalidState { .. } => ApiError::new(StatusCode::CONFLICT, "INVALID_STATE", message),
            DomainError::PermissionDenied { .. } => ApiError::new(StatusCode::FORBIDDEN, "PERMISSION_DENIED", message),
        }
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        match error {
            ApplicationError::Domain(err) => err.into(),
            ApplicationError::Repository(RepositoryError::NotFound) => {
                ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "requested resource not found")
            }
            ApplicationError::Repository(RepositoryError::Conflict(message)) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
            }
            ApplicationError::Repository(RepositoryError::Storage(message)) => {
                tracing::error!(error = %message, "存储访问失败");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "storage unavailable")
            }
            ApplicationError::Timeout(message) => ApiError::new(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", message),
            other => {
                tracing::error!(error = %other, "请求处理失败");
                ApiError::internal_server_error(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
