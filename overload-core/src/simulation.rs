//! Simulation lifecycle: owns the server, network, metrics and the dynamic
//! client population.
//!
//! All runtime objects live between `start` and `stop`; client group
//! configs and the behavior records survive across runs. Stopping cancels
//! the root scope, waits for every client and server worker, and resets the
//! behavior clocks so curves replay from zero on the next start.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::Client;
use crate::clock::{now_millis, sleep_cancellable};
use crate::config::EngineConfig;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::network::{Network, NetworkBehavior};
use crate::server::{Server, ServerBehavior};
use crate::SimError;

/// Configuration for a named group of identical clients.
#[derive(Debug, Clone)]
pub struct ClientGroupConfig {
    /// Unique within a simulation; generated when left empty
    pub id: String,
    pub count: usize,
    pub request_rate: Duration,
    pub ramp_up: Duration,
    pub delay: Duration,
    pub behavior_script: String,
}

/// Manages the overall simulation: clients, network, server and metrics.
pub struct Simulation {
    id: String,
    cfg: EngineConfig,
    server: Arc<Server>,
    network: Arc<Network>,
    metrics: Arc<Metrics>,
    configs: Mutex<Vec<ClientGroupConfig>>,
    clients: Mutex<Vec<Arc<Client>>>,
    running: AtomicBool,
    started_at: AtomicI64,
    run: Mutex<Option<(CancellationToken, TaskTracker)>>,
}

impl Simulation {
    /// Creates a stopped simulation with default server and network
    /// behaviors and no client groups.
    pub fn new(index: i64, cfg: EngineConfig) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new(cfg.metrics.clone()));
        let server = Server::new(
            format!("server-{index}"),
            metrics.clone(),
            cfg.server.clone(),
        );
        let network = Network::new(server.clone(), metrics.clone());

        Arc::new(Self {
            id: format!("simulation-{index}"),
            cfg,
            server,
            network,
            metrics,
            configs: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            started_at: AtomicI64::new(0),
            run: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Epoch milliseconds of the last start, 0 before the first run.
    pub fn started_at(&self) -> i64 {
        self.started_at.load(Ordering::SeqCst)
    }

    /// Current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn server_behavior(&self) -> ServerBehavior {
        self.server.behavior()
    }

    pub fn set_server_behavior(&self, behavior: ServerBehavior) {
        self.server.set_behavior(behavior);
    }

    pub fn network_behavior(&self) -> NetworkBehavior {
        self.network.behavior()
    }

    pub fn set_network_behavior(&self, behavior: NetworkBehavior) {
        self.network.set_behavior(behavior);
    }

    /// Lists all client group configs.
    pub fn client_configs(&self) -> Vec<ClientGroupConfig> {
        self.configs.lock().clone()
    }

    /// Fetches one client group config.
    pub fn client_config(&self, id: &str) -> crate::Result<ClientGroupConfig> {
        self.configs
            .lock()
            .iter()
            .find(|cfg| cfg.id == id)
            .cloned()
            .ok_or_else(|| SimError::GroupNotFound { id: id.to_string() })
    }

    /// Adds a client group config, generating an id when none is supplied.
    /// Returns the stored config.
    pub fn add_client_config(
        &self,
        mut config: ClientGroupConfig,
    ) -> crate::Result<ClientGroupConfig> {
        if self.is_running() {
            return Err(SimError::MutationWhileRunning);
        }

        if config.id.trim().is_empty() {
            config.id = uuid::Uuid::new_v4().simple().to_string();
        }

        let mut configs = self.configs.lock();
        if configs.iter().any(|existing| existing.id == config.id) {
            return Err(SimError::DuplicateGroup { id: config.id });
        }
        configs.push(config.clone());
        Ok(config)
    }

    /// Replaces the config with the given id.
    pub fn update_client_config(
        &self,
        id: &str,
        mut config: ClientGroupConfig,
    ) -> crate::Result<()> {
        if self.is_running() {
            return Err(SimError::MutationWhileRunning);
        }

        config.id = id.to_string();
        let mut configs = self.configs.lock();
        match configs.iter_mut().find(|cfg| cfg.id == id) {
            Some(existing) => {
                *existing = config;
                Ok(())
            }
            None => Err(SimError::GroupNotFound { id: id.to_string() }),
        }
    }

    /// Deletes the config with the given id.
    pub fn delete_client_config(&self, id: &str) -> crate::Result<()> {
        if self.is_running() {
            return Err(SimError::MutationWhileRunning);
        }

        let mut configs = self.configs.lock();
        let before = configs.len();
        configs.retain(|cfg| cfg.id != id);
        if configs.len() == before {
            return Err(SimError::GroupNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Removes all client group configs.
    pub fn clear_client_configs(&self) -> crate::Result<()> {
        if self.is_running() {
            return Err(SimError::MutationWhileRunning);
        }
        self.configs.lock().clear();
        Ok(())
    }

    /// Starts the simulation. Returns the run's cancellation token, or
    /// `None` if it was already running.
    pub fn start(self: &Arc<Self>) -> Option<CancellationToken> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }

        tracing::info!(simulation = %self.id, "starting");

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        *self.run.lock() = Some((token.clone(), tracker.clone()));
        self.started_at.store(now_millis(), Ordering::SeqCst);

        if let Err(e) = self.server.start(&token) {
            tracing::warn!(simulation = %self.id, "server start failed: {e}");
        }

        let sim = Arc::clone(self);
        let coordinator_token = token.clone();
        let coordinator_tracker = tracker.clone();
        tracker.spawn(async move {
            sim.schedule_clients(coordinator_token, coordinator_tracker);
        });

        Some(token)
    }

    /// Stops the simulation, waits for all clients and server workers, and
    /// resets the behavior clocks.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!(simulation = %self.id, "stopping");

        let run = self.run.lock().take();
        if let Some((token, _)) = &run {
            token.cancel();
        }

        let clients = std::mem::take(&mut *self.clients.lock());
        let stopper = TaskTracker::new();
        for client in clients {
            stopper.spawn(async move {
                client.stop().await;
            });
        }
        stopper.close();
        stopper.wait().await;

        self.server.shutdown().await;

        if let Some((_, tracker)) = run {
            tracker.close();
            tracker.wait().await;
        }

        // Re-arm both behavior clocks so subsequent starts replay the
        // curves from t = 0
        self.server.reset_behavior();
        self.network.reset_behavior();
    }

    /// Schedules every group's clients across its ramp-up window.
    fn schedule_clients(self: &Arc<Self>, token: CancellationToken, tracker: TaskTracker) {
        let configs = self.configs.lock().clone();
        for (group_index, config) in configs.into_iter().enumerate() {
            let per_client = if config.ramp_up.is_zero() || config.count == 0 {
                Duration::ZERO
            } else {
                config.ramp_up / config.count as u32
            };
            tracing::info!(
                simulation = %self.id,
                group = %config.id,
                count = config.count,
                ramp_up_ms = config.ramp_up.as_millis() as u64,
                "scheduling client group"
            );

            for client_index in 0..config.count {
                let sim = Arc::clone(self);
                let config = config.clone();
                let client_token = token.clone();
                let jitter = per_client.as_secs_f64()
                    * 0.5
                    * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
                let start_in = Duration::from_secs_f64(
                    (config.delay.as_secs_f64()
                        + per_client.as_secs_f64() * client_index as f64
                        + jitter)
                        .max(0.0),
                );
                tracker.spawn(async move {
                    sim.start_client_in(client_token, start_in, config, group_index, client_index)
                        .await;
                });
            }
        }
    }

    /// Starts a single client after `delay`; exits silently when the run is
    /// cancelled first.
    async fn start_client_in(
        &self,
        token: CancellationToken,
        delay: Duration,
        config: ClientGroupConfig,
        group_index: usize,
        client_index: usize,
    ) {
        if sleep_cancellable(&token, delay).await.is_err() {
            return;
        }

        let client = Client::new(
            format!("client-{group_index}-{client_index}"),
            config.id.clone(),
            self.network.clone(),
            self.metrics.clone(),
            &config.behavior_script,
            &self.cfg.behavior,
        );

        self.clients.lock().push(client.clone());
        client.start(&token, config.request_rate);
    }
}
