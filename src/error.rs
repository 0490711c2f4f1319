use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;

use crate::{
    dao::storage::StorageError,
    engine::EngineError,
    services::{notification_service::DispatcherError, proxy_service::ProxyError},
};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable or refused the operation.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// The game engine could not be reached or answered unexpectedly.
    #[error("game engine unavailable")]
    Engine(#[from] EngineError),
    /// The notification queue refused a request.
    #[error("notification queue unavailable")]
    Queue(#[from] DispatcherError),
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            return ServiceError::NotFound(err.to_string());
        }
        ServiceError::Unavailable(err)
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// The upstream engine failed.
    #[error("bad gateway: {0}")]
    BadGateway(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Engine(source) => AppError::BadGateway(source.to_string()),
            ServiceError::Queue(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
        }
    }
}

impl From<ProxyError> for AppError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::ReadBody { .. } => AppError::BadRequest(err.to_string()),
            ProxyError::ClientBuilder { .. } | ProxyError::Upstream { .. } => {
                AppError::BadGateway(err.to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        (status, payload).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rows_map_to_not_found() {
        let err: ServiceError = StorageError::not_found("seat", "p1").into();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn engine_failures_map_to_bad_gateway() {
        let err = ServiceError::Engine(EngineError::NoPlayers);
        assert_eq!(
            AppError::from(err).into_response().status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
