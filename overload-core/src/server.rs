//! The simulated server.
//!
//! Two processing modes share one curve-driven core. In direct mode every
//! request is processed inline: a work duration is sampled from the
//! response-time curves, slept cooperatively, and a synthetic error is
//! sampled from the error-rate curve. In managed mode requests pass through
//! a bounded queue served by a fixed worker pool while a resource manager
//! simulates CPU, memory, leak and GC dynamics that feed back into response
//! times and error rates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::sleep_cancellable;
use crate::config::ServerConfig;
use crate::curve::{BehaviorPoint, CurveFn};
use crate::metrics::{Metrics, ResourceMetrics};
use crate::request::{Request, Response};
use crate::SimError;

/// Resource configuration, part of [`ServerBehavior`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSettings {
    pub max_concurrent_requests: usize,
    pub max_memory_mb: u64,
    pub max_queue_size: usize,
    pub memory_leak_rate_mb_per_sec: f64,
    pub memory_per_request_mb: f64,
    pub gc_pause_interval_sec: f64,
    pub gc_pause_duration_ms: f64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 100,
            max_memory_mb: 1024,
            max_queue_size: 500,
            memory_leak_rate_mb_per_sec: 0.1,
            memory_per_request_mb: 2.0,
            gc_pause_interval_sec: 10.0,
            gc_pause_duration_ms: 50.0,
        }
    }
}

/// Current server resource state, derived at runtime by the resource
/// manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceState {
    pub active_requests: i64,
    pub current_memory_mb: f64,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub queue_utilization: f64,
    pub threads_utilization: f64,
    pub average_queue_time_ms: f64,
    pub max_queue_time_ms: f64,
}

/// User-editable server scenario: curve horizon, response-time band,
/// error-rate curve and resource settings.
#[derive(Debug, Clone)]
pub struct ServerBehavior {
    /// Curve horizon in seconds (the x-axis span)
    pub to: i64,
    pub response_time_from: i64,
    pub response_time_to: i64,
    pub errors: Vec<BehaviorPoint>,
    pub response_time_min: Vec<BehaviorPoint>,
    pub response_time_max: Vec<BehaviorPoint>,
    pub resource_management_enabled: bool,
    pub resource_settings: ResourceSettings,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            to: 0,
            response_time_from: 0,
            response_time_to: 100,
            errors: vec![BehaviorPoint::curve(0.0, 0.0), BehaviorPoint::curve(1.0, 0.0)],
            response_time_min: vec![
                BehaviorPoint::curve(0.0, 0.1),
                BehaviorPoint::curve(1.0, 0.1),
            ],
            response_time_max: vec![
                BehaviorPoint::curve(0.0, 0.5),
                BehaviorPoint::curve(1.0, 0.5),
            ],
            resource_management_enabled: false,
            resource_settings: ResourceSettings::default(),
        }
    }
}

/// Server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct BehaviorState {
    behavior: ServerBehavior,
    error_rate: Arc<CurveFn>,
    rt_min: Arc<CurveFn>,
    rt_max: Arc<CurveFn>,
    /// Set on the first request after a behavior change so curves replay
    /// from t = 0
    started_at: Option<Instant>,
}

impl BehaviorState {
    fn new(behavior: ServerBehavior) -> Self {
        let horizon_ms = behavior.to as f64 * 1000.0;
        let error_rate = Arc::new(CurveFn::new(
            0.0,
            horizon_ms,
            0.0,
            1.0,
            behavior.errors.clone(),
        ));
        let rt_min = Arc::new(CurveFn::new(
            0.0,
            horizon_ms,
            behavior.response_time_from as f64,
            behavior.response_time_to as f64,
            behavior.response_time_min.clone(),
        ));
        let rt_max = Arc::new(CurveFn::new(
            0.0,
            horizon_ms,
            behavior.response_time_from as f64,
            behavior.response_time_to as f64,
            behavior.response_time_max.clone(),
        ));
        Self {
            behavior,
            error_rate,
            rt_min,
            rt_max,
            started_at: None,
        }
    }
}

struct QueuedRequest {
    request: Request,
    queued_at: Instant,
    reply: oneshot::Sender<crate::Result<Response>>,
}

struct RunHandles {
    token: CancellationToken,
    tracker: TaskTracker,
    queue_tx: Option<mpsc::Sender<QueuedRequest>>,
    queue_rx: Option<Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedRequest>>>>,
}

/// The simulated server: behavior curves plus runtime state.
pub struct Server {
    id: String,
    metrics: Arc<Metrics>,
    cfg: ServerConfig,
    behavior: RwLock<BehaviorState>,
    resource: RwLock<ResourceState>,
    last_gc: Mutex<Instant>,
    queue_times: Mutex<Vec<f64>>,
    run: RwLock<Option<RunHandles>>,
    state: Mutex<ServerState>,
}

impl Server {
    /// Creates a server with the default behavior. No tasks are spawned
    /// until [`Server::start`].
    pub fn new(id: impl Into<String>, metrics: Arc<Metrics>, cfg: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            metrics,
            cfg,
            behavior: RwLock::new(BehaviorState::new(ServerBehavior::default())),
            resource: RwLock::new(ResourceState::default()),
            last_gc: Mutex::new(Instant::now()),
            queue_times: Mutex::new(Vec::new()),
            run: RwLock::new(None),
            state: Mutex::new(ServerState::Created),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Current resource state as maintained by the resource manager.
    pub fn resource_state(&self) -> ResourceState {
        *self.resource.read()
    }

    /// Launches the resource manager and worker pool (managed mode only)
    /// under a scope derived from `parent`.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> crate::Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Created | ServerState::Stopped => *state = ServerState::Running,
                _ => return Err(SimError::AlreadyRunning),
            }
        }

        let token = parent.child_token();
        let tracker = TaskTracker::new();

        let (managed, settings) = {
            let behavior = self.behavior.read();
            (
                behavior.behavior.resource_management_enabled,
                behavior.behavior.resource_settings,
            )
        };

        let mut handles = RunHandles {
            token: token.clone(),
            tracker: tracker.clone(),
            queue_tx: None,
            queue_rx: None,
        };

        if managed {
            *self.resource.write() = ResourceState::default();
            *self.last_gc.lock() = Instant::now();
            self.queue_times.lock().clear();

            let (queue_tx, queue_rx) = mpsc::channel(settings.max_queue_size.max(1));
            let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
            handles.queue_tx = Some(queue_tx.clone());
            handles.queue_rx = Some(queue_rx.clone());

            let server = Arc::clone(self);
            let manager_token = token.clone();
            tracker.spawn(async move {
                server.resource_manager(manager_token, queue_tx).await;
            });

            for _ in 0..settings.max_concurrent_requests.max(1) {
                let server = Arc::clone(self);
                let worker_token = token.clone();
                let worker_rx = queue_rx.clone();
                tracker.spawn(async move {
                    server.worker(worker_token, worker_rx).await;
                });
            }
        }

        *self.run.write() = Some(handles);
        tracing::debug!(server = %self.id, managed, "server started");
        Ok(())
    }

    /// Cancels the server's scope, waits for workers to drain, and resolves
    /// any still-queued request with a cancellation error.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Running {
                return;
            }
            *state = ServerState::Stopping;
        }

        let handles = self.run.write().take();
        if let Some(handles) = handles {
            handles.token.cancel();
            handles.tracker.close();
            handles.tracker.wait().await;

            if let Some(queue_rx) = handles.queue_rx {
                let mut rx = queue_rx.lock().await;
                rx.close();
                while let Ok(queued) = rx.try_recv() {
                    let _ = queued.reply.send(Err(SimError::Cancelled));
                }
            }
        }

        *self.state.lock() = ServerState::Stopped;
        tracing::debug!(server = %self.id, "server stopped");
    }

    /// Routes a request to direct or managed processing.
    pub async fn handle_request(&self, req: Request) -> crate::Result<Response> {
        let (managed, token) = {
            let run = self.run.read();
            let Some(handles) = run.as_ref() else {
                return Err(SimError::Cancelled);
            };
            (handles.queue_tx.clone(), handles.token.clone())
        };

        match managed {
            Some(queue_tx) => self.handle_managed(req, queue_tx, token).await,
            None => self.process_request(req, false, &token).await,
        }
    }

    /// Queue-based processing with admission control.
    async fn handle_managed(
        &self,
        req: Request,
        queue_tx: mpsc::Sender<QueuedRequest>,
        token: CancellationToken,
    ) -> crate::Result<Response> {
        // Admission check: reject outright under extreme memory pressure
        if self.resource.read().memory_utilization > 0.98 {
            return Err(SimError::ServerOutOfMemory);
        }

        if token.is_cancelled() {
            return Err(SimError::Cancelled);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = QueuedRequest {
            request: req,
            queued_at: Instant::now(),
            reply: reply_tx,
        };

        // Non-blocking enqueue so a full queue is detected immediately
        match queue_tx.try_send(queued) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(SimError::ServerQueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(SimError::Cancelled),
        }

        tokio::select! {
            _ = token.cancelled() => Err(SimError::Cancelled),
            reply = reply_rx => reply.unwrap_or(Err(SimError::Cancelled)),
        }
    }

    /// A pool worker: dequeues one request at a time, records its queue
    /// time, and processes it with resource impact applied.
    async fn worker(
        self: Arc<Self>,
        token: CancellationToken,
        queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedRequest>>>,
    ) {
        loop {
            let queued = {
                let mut rx = queue_rx.lock().await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => return,
                    },
                }
            };

            self.resource.write().active_requests += 1;

            let waited_ms = queued.queued_at.elapsed().as_secs_f64() * 1000.0;
            self.record_queue_time(waited_ms);

            let result = self.process_request(queued.request, true, &token).await;
            let _ = queued.reply.send(result);

            self.resource.write().active_requests -= 1;
        }
    }

    fn record_queue_time(&self, queue_time_ms: f64) {
        let mut times = self.queue_times.lock();
        times.push(queue_time_ms);
        if times.len() > self.cfg.queue_time_samples {
            times.remove(0);
        }
        let avg = times.iter().sum::<f64>() / times.len() as f64;
        drop(times);

        let mut resource = self.resource.write();
        if queue_time_ms > resource.max_queue_time_ms {
            resource.max_queue_time_ms = queue_time_ms;
        }
        resource.average_queue_time_ms = avg;
    }

    /// Background task simulating resource consumption and recovery.
    async fn resource_manager(
        self: Arc<Self>,
        token: CancellationToken,
        queue_tx: mpsc::Sender<QueuedRequest>,
    ) {
        let mut ticker = tokio::time::interval(self.cfg.resource_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.update_resources(&queue_tx),
            }
        }
    }

    fn update_resources(&self, queue_tx: &mpsc::Sender<QueuedRequest>) {
        let settings = self.behavior.read().behavior.resource_settings;
        let mut resource = self.resource.write();

        let max_requests = settings.max_concurrent_requests.max(1) as f64;
        resource.threads_utilization = resource.active_requests as f64 / max_requests;

        // CPU grows non-linearly with load: slow at first, accelerating
        // toward capacity, smoothed with an exponential moving average
        let load_factor = resource.threads_utilization;
        let target_cpu = (load_factor.powf(1.5) * 0.95).min(1.0);
        resource.cpu_utilization += (target_cpu - resource.cpu_utilization) * 0.3;
        resource.cpu_utilization = resource.cpu_utilization.clamp(0.0, 1.0);

        // Memory tracks base + per-request cost, with a persistent leak
        // accumulating while under load
        let base_memory_mb = max_requests * 0.5;
        let target_memory_mb =
            base_memory_mb + resource.active_requests as f64 * settings.memory_per_request_mb;

        if load_factor > 0.1 {
            resource.current_memory_mb +=
                settings.memory_leak_rate_mb_per_sec * 0.1 * load_factor;
        }

        if resource.current_memory_mb < target_memory_mb {
            let diff = target_memory_mb - resource.current_memory_mb;
            resource.current_memory_mb += diff / 2.0;
        } else if resource.current_memory_mb > target_memory_mb && load_factor < 0.1 {
            let diff = resource.current_memory_mb - target_memory_mb;
            resource.current_memory_mb -= diff / 20.0;
        }

        let max_memory_mb = settings.max_memory_mb.max(1) as f64;
        if resource.current_memory_mb > max_memory_mb {
            resource.current_memory_mb = max_memory_mb;
        }
        resource.memory_utilization = resource.current_memory_mb / max_memory_mb;

        // Periodic GC sweep: frees accumulated leak but keeps the working
        // set for active requests
        {
            let mut last_gc = self.last_gc.lock();
            if last_gc.elapsed().as_secs_f64() > settings.gc_pause_interval_sec {
                *last_gc = Instant::now();
                let after_gc = target_memory_mb * 1.1;
                if resource.current_memory_mb > after_gc {
                    resource.current_memory_mb = after_gc;
                    resource.memory_utilization = resource.current_memory_mb / max_memory_mb;
                }
            }
        }

        let queue_capacity = queue_tx.max_capacity();
        let queued = queue_capacity - queue_tx.capacity();
        resource.queue_utilization = queued as f64 / queue_capacity.max(1) as f64;

        self.metrics.set_resource_state(ResourceMetrics {
            active_requests: resource.active_requests,
            queued_requests: queued as i64,
            cpu_utilization: resource.cpu_utilization,
            memory_utilization: resource.memory_utilization,
            queue_utilization: resource.queue_utilization,
            threads_utilization: resource.threads_utilization,
            average_queue_time_ms: resource.average_queue_time_ms,
            max_queue_time_ms: resource.max_queue_time_ms,
        });
    }

    /// How the current resource state inflates response time and error
    /// rate.
    fn resource_impact(&self) -> (f64, f64) {
        let resource = self.resource.read();

        let mut multiplier = 1.0;
        if resource.cpu_utilization > 0.7 {
            multiplier *= 1.0 + resource.cpu_utilization.powi(3) * 2.0;
        }
        if resource.memory_utilization > 0.8 {
            let pressure = (resource.memory_utilization - 0.8) / 0.2;
            multiplier *= 1.0 + pressure * 3.0;
        }
        if resource.threads_utilization > 0.7 {
            multiplier *= 1.0 + resource.threads_utilization.powi(2);
        }

        let mut additional_error_rate = 0.0;
        if resource.cpu_utilization > 0.9 {
            additional_error_rate += (resource.cpu_utilization - 0.9) * 0.5;
        }
        if resource.memory_utilization > 0.9 {
            additional_error_rate += (resource.memory_utilization - 0.9) * 0.3;
        }

        (multiplier, additional_error_rate)
    }

    /// Extra work time while inside a GC pause window.
    fn gc_pause_ms(&self) -> f64 {
        let settings_duration = self.behavior.read().behavior.resource_settings.gc_pause_duration_ms;
        let since_gc_ms = self.last_gc.lock().elapsed().as_secs_f64() * 1000.0;
        if since_gc_ms < settings_duration {
            settings_duration
        } else {
            0.0
        }
    }

    /// Shared request-processing core for both modes.
    async fn process_request(
        &self,
        req: Request,
        managed: bool,
        token: &CancellationToken,
    ) -> crate::Result<Response> {
        let (multiplier, additional_error_rate) = if managed {
            self.resource_impact()
        } else {
            (1.0, 0.0)
        };

        let (error_rate, rt_min, rt_max, started_at) = {
            let mut behavior = self.behavior.write();
            let started_at = *behavior.started_at.get_or_insert_with(Instant::now);
            (
                behavior.error_rate.clone(),
                behavior.rt_min.clone(),
                behavior.rt_max.clone(),
                started_at,
            )
        };

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;

        let mut min = rt_min.eval(elapsed_ms);
        let mut max = rt_max.eval(elapsed_ms);
        if min > max {
            std::mem::swap(&mut min, &mut max);
        }

        let mut work_ms = if max > min {
            let mean = (min + max) / 2.0;
            let stddev = (max - min) / 6.0;
            match Normal::new(mean, stddev) {
                Ok(normal) => normal.sample(&mut rand::thread_rng()).max(0.0),
                Err(_) => mean,
            }
        } else {
            min
        };

        work_ms *= multiplier;
        if managed {
            work_ms += self.gc_pause_ms();
        }

        sleep_cancellable(token, Duration::from_secs_f64(work_ms.max(0.0) / 1000.0)).await?;

        let total_error_rate = (error_rate.eval(elapsed_ms) + additional_error_rate).min(1.0);
        if total_error_rate > 0.0 && rand::thread_rng().gen::<f64>() < total_error_rate {
            return Err(SimError::ServerError);
        }

        Ok(Response::ok(req.id, "OK"))
    }

    /// Returns the current behavior.
    pub fn behavior(&self) -> ServerBehavior {
        self.behavior.read().behavior.clone()
    }

    /// Replaces the behavior and resets the curve clock, so curves replay
    /// from t = 0 on the next request.
    pub fn set_behavior(&self, behavior: ServerBehavior) {
        *self.behavior.write() = BehaviorState::new(behavior);
    }

    /// Re-applies the current behavior, clearing the curve clock.
    pub fn reset_behavior(&self) {
        self.set_behavior(self.behavior());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;

    fn constant_rt_behavior(work_ms: i64) -> ServerBehavior {
        ServerBehavior {
            to: 60,
            response_time_from: work_ms,
            response_time_to: work_ms,
            response_time_min: vec![
                BehaviorPoint::curve(0.0, 0.5),
                BehaviorPoint::curve(1.0, 0.5),
            ],
            response_time_max: vec![
                BehaviorPoint::curve(0.0, 0.5),
                BehaviorPoint::curve(1.0, 0.5),
            ],
            ..ServerBehavior::default()
        }
    }

    fn server() -> Arc<Server> {
        let metrics = Arc::new(Metrics::new(MetricsConfig::default()));
        Server::new("server-test", metrics, ServerConfig::default())
    }

    #[tokio::test]
    async fn direct_mode_returns_ok_response() {
        let server = server();
        let mut behavior = constant_rt_behavior(5);
        behavior.resource_management_enabled = false;
        server.set_behavior(behavior);

        let root = CancellationToken::new();
        server.start(&root).unwrap();

        let resp = server
            .handle_request(Request::new("r1", "c1", "test data"))
            .await
            .unwrap();
        assert!(resp.ok);
        assert_eq!(resp.data, "OK");

        server.shutdown().await;
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn full_error_curve_fails_every_request() {
        let server = server();
        let mut behavior = constant_rt_behavior(1);
        behavior.errors = vec![BehaviorPoint::curve(0.0, 1.0), BehaviorPoint::curve(1.0, 1.0)];
        server.set_behavior(behavior);

        let root = CancellationToken::new();
        server.start(&root).unwrap();

        for _ in 0..10 {
            let result = server
                .handle_request(Request::new("r1", "c1", "test data"))
                .await;
            assert!(matches!(result, Err(SimError::ServerError)));
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn queue_full_is_reported_immediately() {
        let server = server();
        let mut behavior = constant_rt_behavior(1_000);
        behavior.resource_management_enabled = true;
        behavior.resource_settings.max_concurrent_requests = 1;
        behavior.resource_settings.max_queue_size = 1;
        server.set_behavior(behavior);

        let root = CancellationToken::new();
        server.start(&root).unwrap();

        // First request occupies the worker, second fills the queue
        for i in 0..2 {
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server
                    .handle_request(Request::new(format!("r{i}"), "c1", "test data"))
                    .await;
            });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        let result = server
            .handle_request(Request::new("r3", "c1", "test data"))
            .await;
        assert!(matches!(result, Err(SimError::ServerQueueFull)));
        assert!(start.elapsed() < Duration::from_millis(50));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn memory_pressure_rejects_admission() {
        let server = server();
        let mut behavior = constant_rt_behavior(1);
        behavior.resource_management_enabled = true;
        // Base memory (max_concurrent * 0.5 MB) dwarfs the 1 MB cap, so the
        // memory utilization pins at 1.0 after the first ticks
        behavior.resource_settings.max_concurrent_requests = 100;
        behavior.resource_settings.max_memory_mb = 1;
        server.set_behavior(behavior);

        let root = CancellationToken::new();
        server.start(&root).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let result = server
            .handle_request(Request::new("r1", "c1", "test data"))
            .await;
        assert!(matches!(result, Err(SimError::ServerOutOfMemory)));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn memory_leak_accumulates_under_load() {
        let server = server();
        let mut behavior = constant_rt_behavior(30_000);
        behavior.resource_management_enabled = true;
        behavior.resource_settings.max_concurrent_requests = 1;
        behavior.resource_settings.max_queue_size = 4;
        behavior.resource_settings.memory_per_request_mb = 0.0;
        behavior.resource_settings.memory_leak_rate_mb_per_sec = 10.0;
        behavior.resource_settings.gc_pause_interval_sec = 3_600.0;
        behavior.resource_settings.max_memory_mb = 10_000;
        server.set_behavior(behavior);

        let root = CancellationToken::new();
        server.start(&root).unwrap();

        // One in-flight request keeps the single worker busy: load factor 1.0
        let busy = server.clone();
        tokio::spawn(async move {
            let _ = busy
                .handle_request(Request::new("r-busy", "c1", "test data"))
                .await;
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        let leaked = server.resource_state().current_memory_mb;
        server.shutdown().await;

        // ~10 MB/s leak for ~3 s at full load, on top of ~0.5 MB baseline
        assert!(
            leaked > 20.0 && leaked < 45.0,
            "unexpected leak amount: {leaked} MB"
        );
    }

    #[tokio::test]
    async fn gc_sweep_reclaims_leaked_memory() {
        let server = server();
        let mut behavior = constant_rt_behavior(30_000);
        behavior.resource_management_enabled = true;
        behavior.resource_settings.max_concurrent_requests = 1;
        behavior.resource_settings.max_queue_size = 4;
        behavior.resource_settings.memory_per_request_mb = 0.0;
        behavior.resource_settings.memory_leak_rate_mb_per_sec = 100.0;
        behavior.resource_settings.gc_pause_interval_sec = 1.0;
        behavior.resource_settings.max_memory_mb = 10_000;
        server.set_behavior(behavior);

        let root = CancellationToken::new();
        server.start(&root).unwrap();

        let busy = server.clone();
        tokio::spawn(async move {
            let _ = busy
                .handle_request(Request::new("r-busy", "c1", "test data"))
                .await;
        });

        // Leak grows ~10 MB per tick; each sweep snaps memory back down to
        // 1.1x the working-set target (~0.55 MB here)
        let mut saw_growth = false;
        let mut saw_sweep = false;
        for _ in 0..150 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let memory = server.resource_state().current_memory_mb;
            if memory > 5.0 {
                saw_growth = true;
            }
            if saw_growth && memory <= 1.0 {
                saw_sweep = true;
                break;
            }
        }
        server.shutdown().await;

        assert!(saw_growth, "leak never accumulated");
        assert!(saw_sweep, "GC sweep never reclaimed the leak");
    }

    #[tokio::test]
    async fn shutdown_resolves_queued_requests() {
        let server = server();
        let mut behavior = constant_rt_behavior(30_000);
        behavior.resource_management_enabled = true;
        behavior.resource_settings.max_concurrent_requests = 1;
        behavior.resource_settings.max_queue_size = 2;
        server.set_behavior(behavior);

        let root = CancellationToken::new();
        server.start(&root).unwrap();

        let mut waiters = Vec::new();
        for i in 0..3 {
            let server = server.clone();
            waiters.push(tokio::spawn(async move {
                server
                    .handle_request(Request::new(format!("r{i}"), "c1", "test data"))
                    .await
            }));
            // One request reaches the worker, the next two sit in the queue
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let start = Instant::now();
        server.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(2));

        for waiter in waiters {
            let result = waiter.await.unwrap();
            assert!(matches!(result, Err(SimError::Cancelled)));
        }
    }

    #[tokio::test]
    async fn behavior_swap_resets_curve_clock() {
        let server = server();
        server.set_behavior(constant_rt_behavior(1));

        let root = CancellationToken::new();
        server.start(&root).unwrap();
        let _ = server
            .handle_request(Request::new("r1", "c1", "test data"))
            .await;

        server.set_behavior(constant_rt_behavior(1));
        assert!(server.behavior.read().started_at.is_none());

        server.shutdown().await;
    }
}
