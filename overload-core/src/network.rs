//! The simulated network between clients and the server.
//!
//! Both directions of a request pass through [`Network::send`]: a one-way
//! latency sampled from the latency curves, a drop decision sampled from the
//! drop-rate curve, the server call in between, and the same treatment on
//! the way back. All latency and loss are synthesized; nothing touches a
//! real socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tokio_util::sync::CancellationToken;

use crate::clock::sleep_cancellable;
use crate::curve::{BehaviorPoint, CurveFn};
use crate::metrics::Metrics;
use crate::request::{Request, Response};
use crate::server::Server;
use crate::SimError;

/// User-editable network scenario: curve horizon, latency band, and drop
/// rate curve.
#[derive(Debug, Clone)]
pub struct NetworkBehavior {
    /// Curve horizon in seconds (the x-axis span)
    pub to: i64,
    pub latency_from: i64,
    pub latency_to: i64,
    pub drop_rate: Vec<BehaviorPoint>,
    pub latency_min: Vec<BehaviorPoint>,
    pub latency_max: Vec<BehaviorPoint>,
}

impl Default for NetworkBehavior {
    fn default() -> Self {
        Self {
            to: 0,
            latency_from: 0,
            latency_to: 100,
            drop_rate: vec![BehaviorPoint::curve(0.0, 0.0), BehaviorPoint::curve(1.0, 0.0)],
            latency_min: vec![BehaviorPoint::curve(0.0, 0.1), BehaviorPoint::curve(1.0, 0.1)],
            latency_max: vec![BehaviorPoint::curve(0.0, 0.4), BehaviorPoint::curve(1.0, 0.4)],
        }
    }
}

struct BehaviorState {
    behavior: NetworkBehavior,
    drop_rate: Arc<CurveFn>,
    latency_min: Arc<CurveFn>,
    latency_max: Arc<CurveFn>,
    started_at: Option<Instant>,
}

impl BehaviorState {
    fn new(behavior: NetworkBehavior) -> Self {
        let horizon_ms = behavior.to as f64 * 1000.0;
        let drop_rate = Arc::new(CurveFn::new(
            0.0,
            horizon_ms,
            0.0,
            1.0,
            behavior.drop_rate.clone(),
        ));
        let latency_min = Arc::new(CurveFn::new(
            0.0,
            horizon_ms,
            behavior.latency_from as f64,
            behavior.latency_to as f64,
            behavior.latency_min.clone(),
        ));
        let latency_max = Arc::new(CurveFn::new(
            0.0,
            horizon_ms,
            behavior.latency_from as f64,
            behavior.latency_to as f64,
            behavior.latency_max.clone(),
        ));
        Self {
            behavior,
            drop_rate,
            latency_min,
            latency_max,
            started_at: None,
        }
    }
}

/// Simulated bidirectional network mediating client and server.
pub struct Network {
    server: Arc<Server>,
    metrics: Arc<Metrics>,
    state: RwLock<BehaviorState>,
}

impl Network {
    pub fn new(server: Arc<Server>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            server,
            metrics,
            state: RwLock::new(BehaviorState::new(NetworkBehavior::default())),
        })
    }

    /// Returns the current behavior.
    pub fn behavior(&self) -> NetworkBehavior {
        self.state.read().behavior.clone()
    }

    /// Replaces the behavior; curves replay from t = 0 on the next send.
    pub fn set_behavior(&self, behavior: NetworkBehavior) {
        *self.state.write() = BehaviorState::new(behavior);
    }

    /// Re-applies the current behavior, clearing the curve clock.
    pub fn reset_behavior(&self) {
        self.set_behavior(self.behavior());
    }

    /// One-way trip: sampled latency (cancellable sleep), then a drop
    /// decision. Returns the latency actually spent either way.
    async fn one_way_trip(
        &self,
        token: &CancellationToken,
        elapsed_ms: f64,
        drop_rate: &CurveFn,
        latency_min: &CurveFn,
        latency_max: &CurveFn,
    ) -> (Duration, crate::Result<()>) {
        let mut min = latency_min.eval(elapsed_ms);
        let mut max = latency_max.eval(elapsed_ms);
        if min > max {
            std::mem::swap(&mut min, &mut max);
        }

        let mut latency_ms = if max > min {
            // Mean at the band center, stddev chosen so ~99.7% of samples
            // fall inside the band
            let mean = (min + max) / 2.0;
            let stddev = (max - min) / 6.0;
            match Normal::new(mean, stddev) {
                Ok(normal) => normal.sample(&mut rand::thread_rng()),
                Err(_) => mean,
            }
        } else {
            min
        };
        latency_ms = latency_ms.max(1.0);

        let latency = Duration::from_secs_f64(latency_ms / 1000.0);
        if let Err(e) = sleep_cancellable(token, latency).await {
            return (latency, Err(e));
        }

        let drop = drop_rate.eval(elapsed_ms);
        if drop > 0.0 && rand::thread_rng().gen::<f64>() < drop {
            return (latency, Err(SimError::NetworkPacketLost));
        }

        (latency, Ok(()))
    }

    /// Transmits a request through the simulated network to the server and
    /// carries the response back.
    pub async fn send(&self, token: &CancellationToken, req: Request) -> crate::Result<Response> {
        let (drop_rate, latency_min, latency_max, started_at) = {
            let mut state = self.state.write();
            let started_at = *state.started_at.get_or_insert_with(Instant::now);
            (
                state.drop_rate.clone(),
                state.latency_min.clone(),
                state.latency_max.clone(),
                started_at,
            )
        };

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        let (request_latency, forward) = self
            .one_way_trip(token, elapsed_ms, &drop_rate, &latency_min, &latency_max)
            .await;
        self.metrics.record_request_latency(request_latency);
        forward?;

        self.metrics.inc_server_received();
        let resp = match self.server.handle_request(req.clone()).await {
            Ok(resp) if resp.ok => {
                self.metrics.inc_server_successes();
                resp
            }
            Ok(resp) => {
                self.metrics.inc_server_errors();
                resp
            }
            Err(SimError::ServerError) => {
                // Synthetic failure: the error response still travels back
                // through the network
                self.metrics.inc_server_errors();
                Response::error(req.id.clone(), "Server Error")
            }
            Err(e) => {
                // Admission rejections and cancellations surface as
                // transport errors without a return trip
                self.metrics.inc_server_errors();
                return Err(e);
            }
        };

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        let (response_latency, back) = self
            .one_way_trip(token, elapsed_ms, &drop_rate, &latency_min, &latency_max)
            .await;
        self.metrics.record_response_latency(response_latency);
        back?;

        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricsConfig, ServerConfig};
    use crate::server::ServerBehavior;

    fn fast_server_behavior() -> ServerBehavior {
        ServerBehavior {
            to: 60,
            response_time_from: 1,
            response_time_to: 1,
            ..ServerBehavior::default()
        }
    }

    fn fast_network_behavior() -> NetworkBehavior {
        NetworkBehavior {
            to: 60,
            latency_from: 1,
            latency_to: 2,
            ..NetworkBehavior::default()
        }
    }

    async fn setup() -> (Arc<Network>, Arc<Server>, Arc<Metrics>, CancellationToken) {
        let metrics = Arc::new(Metrics::new(MetricsConfig::default()));
        let server = Server::new("server-test", metrics.clone(), ServerConfig::default());
        server.set_behavior(fast_server_behavior());
        let root = CancellationToken::new();
        server.start(&root).unwrap();
        let network = Network::new(server.clone(), metrics.clone());
        network.set_behavior(fast_network_behavior());
        (network, server, metrics, root)
    }

    #[tokio::test]
    async fn delivers_request_and_response() {
        let (network, server, metrics, root) = setup().await;

        let resp = network
            .send(&root, Request::new("r1", "c1", "test data"))
            .await
            .unwrap();
        assert!(resp.ok);

        let snap = metrics.snapshot();
        assert_eq!(snap.server_received_requests, 1);
        assert_eq!(snap.server_success_responses, 1);
        assert!(snap.max_request_latency >= 1);
        assert!(snap.max_response_latency >= 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn full_drop_rate_loses_every_packet() {
        let (network, server, metrics, root) = setup().await;
        let mut behavior = fast_network_behavior();
        behavior.drop_rate = vec![BehaviorPoint::curve(0.0, 1.0), BehaviorPoint::curve(1.0, 1.0)];
        network.set_behavior(behavior);

        for _ in 0..5 {
            let result = network.send(&root, Request::new("r1", "c1", "test data")).await;
            assert!(matches!(result, Err(SimError::NetworkPacketLost)));
        }

        // Dropped on the forward leg: the server never saw anything
        let snap = metrics.snapshot();
        assert_eq!(snap.server_received_requests, 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn server_error_becomes_error_response() {
        let (network, server, metrics, root) = setup().await;
        let mut behavior = fast_server_behavior();
        behavior.errors = vec![BehaviorPoint::curve(0.0, 1.0), BehaviorPoint::curve(1.0, 1.0)];
        server.set_behavior(behavior);

        let resp = network
            .send(&root, Request::new("r1", "c1", "test data"))
            .await
            .unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.error, "Server Error");

        let snap = metrics.snapshot();
        assert_eq!(snap.server_error_responses, 1);
        assert_eq!(snap.server_success_responses, 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_send() {
        let (network, server, _metrics, root) = setup().await;
        let mut behavior = fast_network_behavior();
        behavior.latency_from = 5_000;
        behavior.latency_to = 5_000;
        network.set_behavior(behavior);

        let send_token = root.clone();
        let handle = tokio::spawn(async move {
            network
                .send(&send_token, Request::new("r1", "c1", "test data"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        root.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SimError::Cancelled)));

        server.shutdown().await;
    }
}
