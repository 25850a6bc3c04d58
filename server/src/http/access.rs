use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;

use super::{error::ApiError, state::AppState};

/// Rejects callers the access policy denies before any handler runs.
pub async fn require_access(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if state.access.allows(authorization) {
        Ok(next.run(request).await)
    } else {
        debug!("Rejected unauthorized request to {}", request.uri());
        Err(ApiError::Unauthorized)
    }
}
