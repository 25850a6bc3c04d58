use super::dto::{ErrorResponse, SaveResponse};
use super::router;
use super::state::{AccessPolicy, AppState};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use serde_json::json;
use shared_types::{ConcurrencyToken, DocumentEnvelope, VERSION_HEADER};
use std::sync::Arc;
use storage_backend::{BackendConfig, Registry};
use tempfile::TempDir;
use tower::util::ServiceExt;

const SERVER_VERSION: &str = "1.5.0";
const DOCUMENT_URI: &str = "/configs/main/platform/monorepo";

fn create_test_app_with(access: AccessPolicy) -> (Router, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let configs = [BackendConfig::file("local", &["main/**"], temp_dir.path())];
    let registry = Registry::from_config(&configs, SERVER_VERSION).unwrap();
    let state = Arc::new(AppState::new(registry, access));

    (router(state), temp_dir)
}

fn create_test_app() -> (Router, TempDir) {
    create_test_app_with(AccessPolicy::open())
}

fn put_request(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
}

fn envelope_body(content: serde_json::Value) -> Body {
    Body::from(
        serde_json::to_vec(&json!({"apiVersion": SERVER_VERSION, "content": content})).unwrap(),
    )
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn etag(response: &Response) -> String {
    response
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_health_check() {
    let (app, _dir) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "config-registry");
    assert_eq!(json["version"], SERVER_VERSION);
    assert!(json.get("timestamp").is_some());
}

#[tokio::test]
async fn test_put_and_get_config() {
    let (app, _dir) = create_test_app();
    let content = json!({"develop": "develop", "main": "main"});

    let response = app
        .clone()
        .oneshot(
            put_request(DOCUMENT_URI)
                .header("if-none-match", "*")
                .body(envelope_body(content.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let put_etag = etag(&response);
    let saved: SaveResponse = json_body(response).await;
    assert!(saved.changed);
    assert_eq!(saved.key, "main/platform/monorepo");
    assert_eq!(saved.token, ConcurrencyToken::of(&content).to_string());

    let response = app
        .oneshot(
            Request::builder()
                .uri(DOCUMENT_URI)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(etag(&response), put_etag);

    let envelope: DocumentEnvelope = json_body(response).await;
    assert_eq!(envelope.api_version, SERVER_VERSION);
    assert_eq!(envelope.content, content);
}

#[tokio::test]
async fn test_get_missing_config() {
    let (app, _dir) = create_test_app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(DOCUMENT_URI)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = json_body(response).await;
    assert_eq!(error.error, "Not Found");

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("{DOCUMENT_URI}?ensure=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("etag").is_none());
    let envelope: DocumentEnvelope = json_body(response).await;
    assert_eq!(envelope.api_version, SERVER_VERSION);
    assert_eq!(envelope.content, json!({}));
}

#[tokio::test]
async fn test_head_config() {
    let (app, _dir) = create_test_app();
    let head = || {
        Request::builder()
            .method("HEAD")
            .uri(DOCUMENT_URI)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(head()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.clone()
        .oneshot(
            put_request(DOCUMENT_URI)
                .body(envelope_body(json!({"n": 1})))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app.oneshot(head()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_stale_if_match_is_rejected() {
    let (app, _dir) = create_test_app();

    let response = app
        .clone()
        .oneshot(
            put_request(DOCUMENT_URI)
                .body(envelope_body(json!({"n": 1})))
                .unwrap(),
        )
        .await
        .unwrap();
    let first = etag(&response);

    let response = app
        .clone()
        .oneshot(
            put_request(DOCUMENT_URI)
                .header("if-match", first.as_str())
                .body(envelope_body(json!({"n": 2})))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            put_request(DOCUMENT_URI)
                .header("if-match", first.as_str())
                .body(envelope_body(json!({"n": 3})))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    let response = app
        .oneshot(
            Request::builder()
                .uri(DOCUMENT_URI)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let envelope: DocumentEnvelope = json_body(response).await;
    assert_eq!(envelope.content, json!({"n": 2}));
}

#[tokio::test]
async fn test_create_twice_is_rejected() {
    let (app, _dir) = create_test_app();

    for expected in [StatusCode::OK, StatusCode::PRECONDITION_FAILED] {
        let response = app
            .clone()
            .oneshot(
                put_request(DOCUMENT_URI)
                    .header("if-none-match", "*")
                    .body(envelope_body(json!({"n": 1})))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), expected);
    }
}

#[tokio::test]
async fn test_unchanged_put_reports_no_change() {
    let (app, _dir) = create_test_app();

    let mut changed = Vec::new();
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                put_request(DOCUMENT_URI)
                    .body(envelope_body(json!({"b": 2, "a": 1})))
                    .unwrap(),
            )
            .await
            .unwrap();
        let saved: SaveResponse = json_body(response).await;
        changed.push(saved.changed);
    }

    assert_eq!(changed, vec![true, false]);
}

#[tokio::test]
async fn test_delete_config() {
    let (app, _dir) = create_test_app();
    let uri = format!("{DOCUMENT_URI}/1.x");
    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri(uri.as_str())
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(delete()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.clone()
        .oneshot(
            put_request(&uri)
                .body(envelope_body(json!({"line": "1.x"})))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app.clone().oneshot(delete()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.oneshot(delete()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_newer_client_version_is_rejected() {
    let (app, _dir) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri(DOCUMENT_URI)
                .header(VERSION_HEADER, "1.6.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: ErrorResponse = json_body(response).await;
    assert_eq!(error.error, "Version Incompatible");
}

#[tokio::test]
async fn test_newer_document_version_is_rejected() {
    let (app, _dir) = create_test_app();
    let body = json!({"apiVersion": "2.0.0", "content": {"n": 1}});

    let response = app
        .oneshot(
            put_request(DOCUMENT_URI)
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unrouted_key() {
    let (app, _dir) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/configs/elsewhere/platform/monorepo")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::MISDIRECTED_REQUEST);
}

#[tokio::test]
async fn test_invalid_key_segment() {
    let (app, _dir) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/configs/main/platform/mono%5Crepo")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: ErrorResponse = json_body(response).await;
    assert_eq!(error.error, "Invalid Key");
}

#[tokio::test]
async fn test_access_policy() {
    let (app, _dir) = create_test_app_with(AccessPolicy::new(vec!["secret".to_string()]));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(DOCUMENT_URI)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(DOCUMENT_URI)
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Health stays reachable without credentials
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_if_match_any_requires_existing_document() {
    let (app, _dir) = create_test_app();
    let put = |content: serde_json::Value| {
        put_request(DOCUMENT_URI)
            .header("if-match", "*")
            .body(envelope_body(content))
            .unwrap()
    };

    let response = app.clone().oneshot(put(json!({"n": 1}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    app.clone()
        .oneshot(
            put_request(DOCUMENT_URI)
                .body(envelope_body(json!({"n": 1})))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app.oneshot(put(json!({"n": 2}))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
