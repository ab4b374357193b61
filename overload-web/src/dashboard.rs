//! The dashboard facade: owns the current simulation and everything the
//! HTTP layer talks to.
//!
//! Only one simulation exists at a time. Resetting stops the previous run,
//! creates a fresh simulation with the default client group, and announces
//! the lifecycle change on the notification stream. Metrics snapshots flow
//! from the emitter to the metrics WebSocket hub through a forwarding task.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use overload_core::config::{DefaultGroupConfig, EngineConfig};
use overload_core::events::MetricsEmitter;
use overload_core::{
    ClientGroupConfig, NetworkBehavior, ServerBehavior, SimError, Simulation,
};
use serde_json::{json, Value};

use crate::dto::{ClientConfigDto, SimulationStatus, SimulationStatusDto};
use crate::ws::WsHub;

/// Minimum interval between metrics WebSocket broadcasts.
const METRICS_BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

/// Errors surfaced by dashboard operations.
#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    /// No simulation has been created yet.
    #[error("simulation does not exist")]
    NoSimulation,

    /// Starting requires at least one client group.
    #[error("no client configurations")]
    NoClientConfigs,

    /// Engine-level validation error.
    #[error(transparent)]
    Sim(#[from] SimError),
}

/// Web-facing controller for the simulation lifecycle.
pub struct Dashboard {
    cfg: EngineConfig,
    simulation: tokio::sync::Mutex<Option<Arc<Simulation>>>,
    run_index: AtomicI64,
    emitter: MetricsEmitter,
    metrics_ws: Arc<WsHub>,
    notify_ws: Arc<WsHub>,
    stop_timer: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dashboard {
    /// Creates the dashboard and starts the metrics forwarding task.
    pub fn new(cfg: EngineConfig) -> Arc<Self> {
        let emitter = MetricsEmitter::new(cfg.emitter.clone());
        let metrics_ws = WsHub::new(Some(METRICS_BROADCAST_INTERVAL));
        let notify_ws = WsHub::new(None);

        let dashboard = Arc::new(Self {
            cfg,
            simulation: tokio::sync::Mutex::new(None),
            run_index: AtomicI64::new(0),
            emitter,
            metrics_ws: metrics_ws.clone(),
            notify_ws,
            stop_timer: parking_lot::Mutex::new(None),
        });

        // Forward emitted snapshots to the metrics stream
        let mut subscription = dashboard.emitter.subscribe(10);
        let forward_hub = metrics_ws;
        tokio::spawn(async move {
            while let Some(snapshot) = subscription.recv().await {
                match serde_json::to_string(&snapshot) {
                    Ok(payload) => forward_hub.broadcast(payload),
                    Err(e) => tracing::warn!("failed to serialize metrics snapshot: {e}"),
                }
            }
        });

        dashboard
    }

    pub fn metrics_hub(&self) -> Arc<WsHub> {
        self.metrics_ws.clone()
    }

    pub fn notify_hub(&self) -> Arc<WsHub> {
        self.notify_ws.clone()
    }

    /// Sends a `{type, payload, timestamp}` event to the notification
    /// stream.
    pub fn notify(&self, event_type: &str, payload: Value) {
        let message = json!({
            "type": event_type,
            "payload": payload,
            "timestamp": overload_core::clock::now_millis(),
        });
        match serde_json::to_string(&message) {
            Ok(text) => self.notify_ws.broadcast(text),
            Err(e) => tracing::warn!("failed to serialize notification: {e}"),
        }
    }

    /// Status for `GET /api/simulation`.
    pub async fn status(&self) -> SimulationStatusDto {
        let simulation = self.simulation.lock().await;
        match simulation.as_ref() {
            None => SimulationStatusDto {
                id: None,
                status: SimulationStatus::None,
                started_at: 0,
            },
            Some(sim) => SimulationStatusDto {
                id: Some(sim.id().to_string()),
                status: if sim.is_running() {
                    SimulationStatus::Running
                } else {
                    SimulationStatus::Stopped
                },
                started_at: sim.started_at(),
            },
        }
    }

    fn abort_stop_timer(&self) {
        if let Some(timer) = self.stop_timer.lock().take() {
            timer.abort();
        }
    }

    /// Stops any previous simulation and creates a fresh one with the
    /// default client group.
    async fn fresh_simulation(&self, slot: &mut Option<Arc<Simulation>>) {
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }

        let index = self.run_index.fetch_add(1, Ordering::SeqCst) + 1;
        let simulation = Simulation::new(index, self.cfg.clone());

        let defaults = DefaultGroupConfig::default();
        let seeded = simulation.add_client_config(ClientGroupConfig {
            id: format!("{:08x}", rand::random::<u32>()),
            count: defaults.count,
            request_rate: defaults.request_rate,
            ramp_up: defaults.ramp_up,
            delay: defaults.delay,
            behavior_script: String::new(),
        });
        if let Err(e) = seeded {
            tracing::warn!("failed to seed default client group: {e}");
        }

        *slot = Some(simulation);
    }

    /// `POST /api/simulation`: reset.
    pub async fn reset(self: &Arc<Self>) {
        tracing::info!("resetting simulation");
        self.abort_stop_timer();

        let mut simulation = self.simulation.lock().await;
        self.fresh_simulation(&mut simulation).await;
        drop(simulation);

        self.notify("simulation_reset", Value::Null);
    }

    /// `PUT /api/simulation`: start, with an optional run-time limit.
    pub async fn start(self: &Arc<Self>, limit: Option<Duration>) -> Result<(), DashboardError> {
        self.abort_stop_timer();

        let mut simulation = self.simulation.lock().await;
        if simulation.is_none() {
            self.fresh_simulation(&mut simulation).await;
        }
        let sim = simulation.as_ref().ok_or(DashboardError::NoSimulation)?;

        if sim.client_configs().is_empty() {
            return Err(DashboardError::NoClientConfigs);
        }

        let Some(token) = sim.start() else {
            tracing::info!("simulation already running");
            return Ok(());
        };
        self.emitter.watch_run(token, sim.metrics());
        drop(simulation);

        self.notify("simulation_started", Value::Null);

        if let Some(limit) = limit.filter(|l| !l.is_zero()) {
            let dashboard = Arc::clone(self);
            *self.stop_timer.lock() = Some(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::info!(limit_secs = limit.as_secs(), "run-time limit reached");
                dashboard.stop().await;
            }));
        }

        Ok(())
    }

    /// `DELETE /api/simulation`: stop.
    pub async fn stop(self: &Arc<Self>) {
        self.abort_stop_timer();

        let simulation = self.simulation.lock().await;
        let Some(sim) = simulation.as_ref() else {
            return;
        };
        sim.stop().await;
        drop(simulation);

        self.notify("simulation_stopped", Value::Null);
    }

    async fn with_simulation<R>(
        &self,
        f: impl FnOnce(&Arc<Simulation>) -> R,
    ) -> Result<R, DashboardError> {
        let simulation = self.simulation.lock().await;
        match simulation.as_ref() {
            Some(sim) => Ok(f(sim)),
            None => Err(DashboardError::NoSimulation),
        }
    }

    /// `GET /api/clients`
    pub async fn client_configs(&self) -> Result<Vec<ClientConfigDto>, DashboardError> {
        self.with_simulation(|sim| {
            sim.client_configs().into_iter().map(Into::into).collect()
        })
        .await
    }

    /// `GET /api/clients/{id}`
    pub async fn client_config(&self, id: &str) -> Result<ClientConfigDto, DashboardError> {
        self.with_simulation(|sim| sim.client_config(id))
            .await?
            .map(Into::into)
            .map_err(Into::into)
    }

    /// `POST /api/clients`
    pub async fn add_client_config(
        &self,
        config: ClientConfigDto,
    ) -> Result<ClientConfigDto, DashboardError> {
        let stored = self
            .with_simulation(|sim| sim.add_client_config(config.into()))
            .await??;
        let dto: ClientConfigDto = stored.into();
        self.notify("client_config_added", json!(dto.clone()));
        Ok(dto)
    }

    /// `PUT /api/clients/{id}`
    pub async fn update_client_config(
        &self,
        id: &str,
        config: ClientConfigDto,
    ) -> Result<(), DashboardError> {
        self.with_simulation(|sim| sim.update_client_config(id, config.clone().into()))
            .await??;
        self.notify("client_config_updated", json!(config));
        Ok(())
    }

    /// `DELETE /api/clients/{id}`
    pub async fn delete_client_config(&self, id: &str) -> Result<(), DashboardError> {
        self.with_simulation(|sim| sim.delete_client_config(id))
            .await??;
        self.notify("client_config_deleted", json!(id));
        Ok(())
    }

    /// `DELETE /api/clients`
    pub async fn clear_client_configs(&self) -> Result<(), DashboardError> {
        self.with_simulation(|sim| sim.clear_client_configs())
            .await??;
        self.notify("client_configs_cleared", Value::Null);
        Ok(())
    }

    /// `GET /api/server`
    pub async fn server_behavior(&self) -> Result<ServerBehavior, DashboardError> {
        self.with_simulation(|sim| sim.server_behavior()).await
    }

    /// `PUT /api/server`
    pub async fn set_server_behavior(
        &self,
        behavior: ServerBehavior,
        notification: Value,
    ) -> Result<(), DashboardError> {
        self.with_simulation(|sim| sim.set_server_behavior(behavior))
            .await?;
        self.notify("server_behavior_updated", notification);
        Ok(())
    }

    /// `GET /api/network`
    pub async fn network_behavior(&self) -> Result<NetworkBehavior, DashboardError> {
        self.with_simulation(|sim| sim.network_behavior()).await
    }

    /// `PUT /api/network`
    pub async fn set_network_behavior(
        &self,
        behavior: NetworkBehavior,
        notification: Value,
    ) -> Result<(), DashboardError> {
        self.with_simulation(|sim| sim.set_network_behavior(behavior))
            .await?;
        self.notify("network_behavior_updated", notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dashboard() -> Arc<Dashboard> {
        Dashboard::new(EngineConfig::default())
    }

    #[tokio::test]
    async fn status_is_none_before_first_reset() {
        let dashboard = dashboard();
        let status = dashboard.status().await;
        assert_eq!(status.status, SimulationStatus::None);
        assert!(status.id.is_none());
        assert_eq!(status.started_at, 0);
    }

    #[tokio::test]
    async fn reset_seeds_the_default_client_group() {
        let dashboard = dashboard();
        dashboard.reset().await;

        let status = dashboard.status().await;
        assert_eq!(status.status, SimulationStatus::Stopped);
        assert!(status.id.is_some());

        let configs = dashboard.client_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].count, 100);
        assert_eq!(configs[0].request_rate, 100);
    }

    #[tokio::test]
    async fn start_requires_client_configs() {
        let dashboard = dashboard();
        dashboard.reset().await;
        dashboard.clear_client_configs().await.unwrap();

        let result = dashboard.start(None).await;
        assert!(matches!(result, Err(DashboardError::NoClientConfigs)));
    }

    #[tokio::test]
    async fn start_and_stop_cycle() {
        let dashboard = dashboard();
        dashboard.reset().await;
        dashboard.clear_client_configs().await.unwrap();
        dashboard
            .add_client_config(ClientConfigDto {
                id: "g1".into(),
                count: 2,
                request_rate: 50,
                ramp_up_time: 0,
                startup_delay: 0,
                behavior: String::new(),
            })
            .await
            .unwrap();

        dashboard.start(None).await.unwrap();
        assert_eq!(dashboard.status().await.status, SimulationStatus::Running);

        // Config mutation is rejected while running
        let rejected = dashboard.clear_client_configs().await;
        assert!(matches!(
            rejected,
            Err(DashboardError::Sim(SimError::MutationWhileRunning))
        ));

        dashboard.stop().await;
        assert_eq!(dashboard.status().await.status, SimulationStatus::Stopped);
    }

    #[tokio::test]
    async fn run_time_limit_stops_the_simulation() {
        let dashboard = dashboard();
        dashboard.reset().await;
        dashboard.clear_client_configs().await.unwrap();
        dashboard
            .add_client_config(ClientConfigDto {
                id: "g1".into(),
                count: 1,
                request_rate: 50,
                ramp_up_time: 0,
                startup_delay: 0,
                behavior: String::new(),
            })
            .await
            .unwrap();

        dashboard
            .start(Some(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(dashboard.status().await.status, SimulationStatus::Running);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(dashboard.status().await.status, SimulationStatus::Stopped);
    }

    #[tokio::test]
    async fn generated_group_id_is_returned() {
        let dashboard = dashboard();
        dashboard.reset().await;

        let stored = dashboard
            .add_client_config(ClientConfigDto {
                id: String::new(),
                count: 1,
                request_rate: 100,
                ramp_up_time: 0,
                startup_delay: 0,
                behavior: String::new(),
            })
            .await
            .unwrap();
        assert!(!stored.id.is_empty());

        let fetched = dashboard.client_config(&stored.id).await.unwrap();
        assert_eq!(fetched.count, 1);
    }
}
