use axum::{
    Json,
    extract::{Path, Query, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{ETAG, IF_MATCH, IF_NONE_MATCH},
    },
};
use shared_types::{ConcurrencyToken, DocumentEnvelope, RegistryKey, VERSION_HEADER};
use std::sync::Arc;
use storage_backend::{Precondition, SaveOutcome};
use tracing::{info, instrument};

use super::{
    dto::{KeyPath, LoadParams, SaveResponse},
    error::{ApiError, ApiResult},
    state::AppState,
};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::BadRequest(format!("Header {name} is not valid text")))
        })
        .transpose()
}

/// Gate the caller's declared protocol version, when it sends one.
fn check_client_version(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if let Some(version) = header_str(headers, VERSION_HEADER)? {
        state.registry.gate().check(version)?;
    }
    Ok(())
}

/// `If-Match: "<token>"` expects that content, `If-Match: *` expects any stored
/// document and `If-None-Match: *` expects nothing stored.
fn precondition(headers: &HeaderMap) -> ApiResult<Precondition> {
    if let Some(raw) = header_str(headers, IF_MATCH.as_str())? {
        if raw.trim() == "*" {
            return Ok(Precondition::Exists);
        }
        return ConcurrencyToken::from_etag(raw)
            .map(Precondition::Matches)
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid If-Match value: {raw}")));
    }

    match header_str(headers, IF_NONE_MATCH.as_str())? {
        Some(raw) if raw.trim() == "*" => Ok(Precondition::Absent),
        Some(raw) => Err(ApiError::BadRequest(format!(
            "Only If-None-Match: * is supported, got {raw}"
        ))),
        None => Ok(Precondition::Any),
    }
}

fn etag_header(token: &ConcurrencyToken) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&token.to_etag()) {
        headers.insert(ETAG, value);
    }
    headers
}

/// HEAD /configs/:registry/:namespace/:name[/:support]
#[instrument(skip(state, headers))]
pub async fn head_config(
    State(state): State<Arc<AppState>>,
    Path(path): Path<KeyPath>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    check_client_version(&state, &headers)?;
    let key = RegistryKey::from(path);

    if state.registry.exists(&key).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// GET /configs/:registry/:namespace/:name[/:support]
/// Load a document, optionally creating a fresh one in memory with `?ensure=true`
#[instrument(skip(state, headers))]
pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(path): Path<KeyPath>,
    Query(params): Query<LoadParams>,
    headers: HeaderMap,
) -> ApiResult<(HeaderMap, Json<DocumentEnvelope>)> {
    check_client_version(&state, &headers)?;
    let key = RegistryKey::from(path);
    info!("Getting config: {}", key);

    let loaded = state.registry.load(&key, params.ensure).await?;
    let headers = loaded
        .token
        .as_ref()
        .map(etag_header)
        .unwrap_or_default();

    Ok((headers, Json(DocumentEnvelope::from(loaded.document))))
}

/// PUT /configs/:registry/:namespace/:name[/:support]
/// Store a document under the precondition carried by `If-Match` / `If-None-Match`
#[instrument(skip(state, headers, envelope))]
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Path(path): Path<KeyPath>,
    headers: HeaderMap,
    Json(envelope): Json<DocumentEnvelope>,
) -> ApiResult<(HeaderMap, Json<SaveResponse>)> {
    check_client_version(&state, &headers)?;
    let precondition = precondition(&headers)?;
    let key = RegistryKey::from(path);
    info!("Putting config: {}", key);

    let outcome = state
        .registry
        .save(&key, &envelope.into_document(), &precondition)
        .await?;

    Ok((
        etag_header(outcome.token()),
        Json(SaveResponse {
            key: key.to_string(),
            token: outcome.token().to_string(),
            changed: matches!(outcome, SaveOutcome::Written(_)),
        }),
    ))
}

/// DELETE /configs/:registry/:namespace/:name[/:support]
#[instrument(skip(state, headers))]
pub async fn delete_config(
    State(state): State<Arc<AppState>>,
    Path(path): Path<KeyPath>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    check_client_version(&state, &headers)?;
    let precondition = precondition(&headers)?;
    let key = RegistryKey::from(path);
    info!("Deleting config: {}", key);

    state.registry.delete(&key, &precondition).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /health
/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "config-registry",
        "version": state.registry.gate().server_version(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
