pub mod calls;
pub mod config;
pub mod coordinator;
pub mod handlers;
pub mod polling;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod state;
pub mod sweeper;
pub mod telemetry;
pub mod websocket;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, render_metrics};
use crate::state::AppState;
use crate::websocket::websocket_handler;

/// Build the full HTTP surface. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` to get peer
/// addresses in the websocket logs.
pub fn build_router(state: AppState) -> Router {
    let ws_routes = Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state.push.clone());

    let poll_routes = polling::router(state.polling.clone());

    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .with_state(state);

    Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .merge(poll_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
