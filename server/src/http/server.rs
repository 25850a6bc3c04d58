use anyhow::Result;
use axum::{
    Router, middleware,
    routing::{MethodRouter, get},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use super::{access, handlers, state::AppState};

fn document_routes() -> MethodRouter<Arc<AppState>> {
    get(handlers::get_config)
        .head(handlers::head_config)
        .put(handlers::put_config)
        .delete(handlers::delete_config)
}

pub fn router(state: Arc<AppState>) -> Router {
    let configs = Router::new()
        .route("/configs/:registry/:namespace/:name", document_routes())
        .route(
            "/configs/:registry/:namespace/:name/:support",
            document_routes(),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            access::require_access,
        ));

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        .merge(configs)
        // Add state
        .with_state(state)
        // Add middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already bound listener.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub async fn start_server(state: Arc<AppState>, bind_address: SocketAddr) -> Result<()> {
    info!("Server listening on {}", bind_address);

    let listener = TcpListener::bind(bind_address).await?;
    serve(listener, state).await
}
