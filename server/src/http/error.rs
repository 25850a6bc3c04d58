use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use storage_backend::RegistryError;
use tracing::error;

use super::dto::ErrorResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Registry(err) => match err {
                RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
                RegistryError::PreconditionFailed { .. } => {
                    (StatusCode::PRECONDITION_FAILED, "Precondition Failed")
                }
                RegistryError::VersionIncompatible { .. } => {
                    (StatusCode::BAD_REQUEST, "Version Incompatible")
                }
                RegistryError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "Invalid Key"),
                RegistryError::InvalidVersion { .. } => {
                    (StatusCode::BAD_REQUEST, "Invalid Version")
                }
                RegistryError::NoBackendMatched(_) => {
                    (StatusCode::MISDIRECTED_REQUEST, "No Backend Matched")
                }
                RegistryError::BackendUnavailable { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "Backend Unavailable")
                }
                RegistryError::Corrupt { .. }
                | RegistryError::ExclusiveAccessUnsupported(_)
                | RegistryError::TransformFailed(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "Storage Error")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = Json(ErrorResponse {
            error: error.to_string(),
            details: Some(self.to_string()),
        });

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
