//! HTTP server wiring for the control plane.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use overload_core::config::EngineConfig;
use tower_http::cors::CorsLayer;

use crate::dashboard::Dashboard;
use crate::handlers::{
    add_client, clear_clients, delete_client, get_client, get_network_behavior, get_server_behavior,
    get_simulation, list_clients, reset_simulation, set_network_behavior, set_server_behavior,
    start_simulation, stop_simulation, update_client,
};
use crate::ws::{ws_metrics, ws_notifications};

#[derive(Clone)]
pub struct AppState {
    pub dashboard: Arc<Dashboard>,
}

/// Builds the API router around a dashboard.
pub fn router(dashboard: Arc<Dashboard>) -> Router {
    let state = AppState { dashboard };

    Router::new()
        .route(
            "/api/simulation",
            get(get_simulation)
                .post(reset_simulation)
                .put(start_simulation)
                .delete(stop_simulation),
        )
        .route(
            "/api/clients",
            get(list_clients).post(add_client).delete(clear_clients),
        )
        .route(
            "/api/clients/{id}",
            get(get_client).put(update_client).delete(delete_client),
        )
        .route(
            "/api/server",
            get(get_server_behavior).put(set_server_behavior),
        )
        .route(
            "/api/network",
            get(get_network_behavior).put(set_network_behavior),
        )
        .route("/api/ws/metrics", get(ws_metrics))
        .route("/api/ws/notifications", get(ws_notifications))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the control-plane server on the given port until the process
/// exits.
pub async fn run_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let dashboard = Dashboard::new(EngineConfig::default());
    let app = router(dashboard);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("dashboard available at http://localhost:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
