//! A synthetic client issuing requests on a jittered cadence.
//!
//! Each iteration of the main loop schedules the request as a subtask so a
//! slow request never delays the cadence, then sleeps the configured rate
//! plus up to 20% jitter either way. The per-request loop is driven by the
//! client's behavior: `on_request` gates (and may delay or time-bound) the
//! send, the outcome fires exactly one of `on_response`/`on_error`/`on_fail`,
//! and `on_retry` decides whether to go around again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::behavior::{ClientBehavior, NoopBehavior, ScriptBehavior};
use crate::clock::sleep_cancellable;
use crate::config::BehaviorConfig;
use crate::metrics::Metrics;
use crate::network::Network;
use crate::request::{Request, Response};
use crate::SimError;

/// A single simulated client.
pub struct Client {
    id: String,
    group: String,
    network: Arc<Network>,
    metrics: Arc<Metrics>,
    behavior: Arc<dyn ClientBehavior>,
    running: AtomicBool,
    token: Mutex<Option<CancellationToken>>,
    tracker: Mutex<Option<TaskTracker>>,
}

impl Client {
    /// Creates a client. An empty script yields the noop behavior; a script
    /// that fails to compile is logged and also falls back to noop.
    pub fn new(
        id: impl Into<String>,
        group: impl Into<String>,
        network: Arc<Network>,
        metrics: Arc<Metrics>,
        behavior_script: &str,
        behavior_cfg: &BehaviorConfig,
    ) -> Arc<Self> {
        let id = id.into();
        let behavior: Arc<dyn ClientBehavior> = if behavior_script.trim().is_empty() {
            Arc::new(NoopBehavior::new())
        } else {
            match ScriptBehavior::new(behavior_script, behavior_cfg.queue_capacity) {
                Ok(script) => Arc::new(script),
                Err(e) => {
                    tracing::warn!(client = %id, "behavior script rejected: {e}");
                    Arc::new(NoopBehavior::new())
                }
            }
        };

        Arc::new(Self {
            id,
            group: group.into(),
            network,
            metrics,
            behavior,
            running: AtomicBool::new(false),
            token: Mutex::new(None),
            tracker: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Begins sending requests at the given rate under a scope derived from
    /// `parent`.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken, rate: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = parent.child_token();
        let tracker = TaskTracker::new();
        *self.token.lock() = Some(token.clone());
        *self.tracker.lock() = Some(tracker.clone());

        let client = Arc::clone(self);
        let loop_tracker = tracker.clone();
        tracker.spawn(async move {
            client.run(token, loop_tracker, rate).await;
        });
    }

    /// Cancels the client's scope, closes its interpreter, and waits for
    /// all in-flight request subtasks.
    pub async fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        self.behavior.close();
        let tracker = self.tracker.lock().take();
        if let Some(tracker) = tracker {
            tracker.close();
            tracker.wait().await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Main cadence loop.
    async fn run(self: Arc<Self>, token: CancellationToken, tracker: TaskTracker, rate: Duration) {
        self.metrics.add_active_client(&self.group);

        loop {
            if token.is_cancelled() {
                break;
            }

            let client = Arc::clone(&self);
            let request_token = token.clone();
            tracker.spawn(async move {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                let req = Request::new(
                    format!("{}-{nanos}", client.id),
                    client.id.clone(),
                    "test data",
                );
                client.request_with_hooks(request_token, req).await;
            });

            // 20% jitter either way keeps client populations from beating
            let jitter = rate.as_secs_f64() * 0.2 * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
            let interval = Duration::from_secs_f64((rate.as_secs_f64() + jitter).max(0.0));
            if sleep_cancellable(&token, interval).await.is_err() {
                break;
            }
        }

        self.metrics.remove_active_client(&self.group);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Sends one request, including pre-send evaluation and the retry loop.
    async fn request_with_hooks(&self, token: CancellationToken, mut req: Request) {
        let behavior = Arc::clone(&self.behavior);
        let mut is_retry = false;

        loop {
            // Pre-request evaluation loop. The timeout is re-captured on
            // every pass so a retry only carries a timeout the script set
            // for this attempt.
            let mut timeout = Duration::ZERO;
            loop {
                let decision = behavior.on_request(&mut req).await;

                if !decision.allow {
                    self.metrics.inc_client_blocked();
                    return;
                }

                if decision.delay_ms > 0 {
                    let delay = Duration::from_millis(decision.delay_ms as u64);
                    if sleep_cancellable(&token, delay).await.is_err() {
                        return;
                    }
                    continue; // Re-evaluate on_request after the delay
                }

                if decision.timeout_ms > 0 {
                    timeout = Duration::from_millis(decision.timeout_ms as u64);
                }
                break;
            }

            self.metrics.inc_client_sent();
            if is_retry {
                self.metrics.inc_client_retries();
            }

            let start = Instant::now();
            let result = self.send_with_timeout(&token, req.clone(), timeout).await;
            self.metrics.record_response_time(start.elapsed());

            let retry = match result {
                Ok(resp) if resp.ok => {
                    self.metrics.inc_client_successes();
                    behavior.on_response(&mut req, &resp).await;
                    return;
                }
                Ok(resp) => {
                    self.metrics.inc_client_errors();
                    behavior.on_error(&mut req, &resp).await;
                    behavior.on_retry(&mut req, Some(&resp), None).await
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    self.metrics.inc_network_failed();
                    behavior.on_fail(&mut req, &e).await;
                    behavior.on_retry(&mut req, None, Some(&e)).await
                }
            };

            if !retry.allow {
                return;
            }
            if retry.delay_ms > 0 {
                let delay = Duration::from_millis(retry.delay_ms as u64);
                if sleep_cancellable(&token, delay).await.is_err() {
                    return;
                }
            }
            is_retry = true;
        }
    }

    /// Races the network send against the optional per-attempt timeout.
    async fn send_with_timeout(
        &self,
        token: &CancellationToken,
        req: Request,
        timeout: Duration,
    ) -> crate::Result<Response> {
        if timeout > Duration::ZERO {
            tokio::select! {
                result = self.network.send(token, req) => result,
                _ = tokio::time::sleep(timeout) => Err(SimError::ClientTimeout),
            }
        } else {
            self.network.send(token, req).await
        }
    }
}
