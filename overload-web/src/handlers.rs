//! REST handlers for the control API.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use overload_core::SimError;

use crate::dashboard::DashboardError;
use crate::dto::{ClientConfigDto, NetworkBehaviorDto, ServerBehaviorDto, SimulationStatusDto};
use crate::server::AppState;

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = match &self {
            DashboardError::NoSimulation => StatusCode::NOT_FOUND,
            DashboardError::NoClientConfigs => StatusCode::BAD_REQUEST,
            DashboardError::Sim(SimError::GroupNotFound { .. }) => StatusCode::NOT_FOUND,
            DashboardError::Sim(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// `GET /api/simulation`
pub async fn get_simulation(State(state): State<AppState>) -> Json<SimulationStatusDto> {
    Json(state.dashboard.status().await)
}

/// `POST /api/simulation`: reset
pub async fn reset_simulation(State(state): State<AppState>) -> StatusCode {
    tracing::info!("[POST /api/simulation] resetting simulation");
    state.dashboard.reset().await;
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    /// Optional run-time limit in seconds
    pub limit: Option<u64>,
}

/// `PUT /api/simulation`: start
pub async fn start_simulation(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
) -> Result<StatusCode, DashboardError> {
    tracing::info!("[PUT /api/simulation] starting simulation");
    let limit = query.limit.filter(|l| *l > 0).map(Duration::from_secs);
    state.dashboard.start(limit).await?;
    Ok(StatusCode::OK)
}

/// `DELETE /api/simulation`: stop
pub async fn stop_simulation(State(state): State<AppState>) -> StatusCode {
    tracing::info!("[DELETE /api/simulation] stopping simulation");
    state.dashboard.stop().await;
    StatusCode::OK
}

/// `GET /api/clients`
pub async fn list_clients(
    State(state): State<AppState>,
) -> Result<Json<Vec<ClientConfigDto>>, DashboardError> {
    Ok(Json(state.dashboard.client_configs().await?))
}

/// `POST /api/clients`
pub async fn add_client(
    State(state): State<AppState>,
    Json(config): Json<ClientConfigDto>,
) -> Result<Json<ClientConfigDto>, DashboardError> {
    tracing::info!("[POST /api/clients] adding client group");
    Ok(Json(state.dashboard.add_client_config(config).await?))
}

/// `DELETE /api/clients`
pub async fn clear_clients(State(state): State<AppState>) -> Result<StatusCode, DashboardError> {
    tracing::info!("[DELETE /api/clients] clearing client groups");
    state.dashboard.clear_client_configs().await?;
    Ok(StatusCode::OK)
}

/// `GET /api/clients/{id}`
pub async fn get_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ClientConfigDto>, DashboardError> {
    Ok(Json(state.dashboard.client_config(&id).await?))
}

/// `PUT /api/clients/{id}`
pub async fn update_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ClientConfigDto>,
) -> Result<StatusCode, DashboardError> {
    tracing::info!(group = %id, "[PUT /api/clients] updating client group");
    state.dashboard.update_client_config(&id, config).await?;
    Ok(StatusCode::OK)
}

/// `DELETE /api/clients/{id}`
pub async fn delete_client(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, DashboardError> {
    tracing::info!(group = %id, "[DELETE /api/clients] deleting client group");
    state.dashboard.delete_client_config(&id).await?;
    Ok(StatusCode::OK)
}

/// `GET /api/server`
pub async fn get_server_behavior(
    State(state): State<AppState>,
) -> Result<Json<ServerBehaviorDto>, DashboardError> {
    Ok(Json(state.dashboard.server_behavior().await?.into()))
}

/// `PUT /api/server`
pub async fn set_server_behavior(
    State(state): State<AppState>,
    Json(behavior): Json<ServerBehaviorDto>,
) -> Result<StatusCode, DashboardError> {
    tracing::info!("[PUT /api/server] updating server behavior");
    state
        .dashboard
        .set_server_behavior(behavior.clone().into(), json!(behavior))
        .await?;
    Ok(StatusCode::OK)
}

/// `GET /api/network`
pub async fn get_network_behavior(
    State(state): State<AppState>,
) -> Result<Json<NetworkBehaviorDto>, DashboardError> {
    Ok(Json(state.dashboard.network_behavior().await?.into()))
}

/// `PUT /api/network`
pub async fn set_network_behavior(
    State(state): State<AppState>,
    Json(behavior): Json<NetworkBehaviorDto>,
) -> Result<StatusCode, DashboardError> {
    tracing::info!("[PUT /api/network] updating network behavior");
    state
        .dashboard
        .set_network_behavior(behavior.clone().into(), json!(behavior))
        .await?;
    Ok(StatusCode::OK)
}
