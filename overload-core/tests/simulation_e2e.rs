//! End-to-end simulation scenarios: whole client populations against
//! curve-driven server and network behaviors.

use std::time::{Duration, Instant};

use overload_core::config::EngineConfig;
use overload_core::{
    BehaviorPoint, ClientGroupConfig, NetworkBehavior, ServerBehavior, Simulation,
};

fn flat(y: f64) -> Vec<BehaviorPoint> {
    vec![BehaviorPoint::curve(0.0, y), BehaviorPoint::curve(1.0, y)]
}

/// Server that answers in ~1 ms with the given error rate.
fn fast_server(error_rate: f64) -> ServerBehavior {
    ServerBehavior {
        to: 60,
        response_time_from: 1,
        response_time_to: 1,
        errors: flat(error_rate),
        ..ServerBehavior::default()
    }
}

/// Network with ~1-2 ms one-way latency and the given drop rate.
fn fast_network(drop_rate: f64) -> NetworkBehavior {
    NetworkBehavior {
        to: 60,
        latency_from: 1,
        latency_to: 2,
        drop_rate: flat(drop_rate),
        ..NetworkBehavior::default()
    }
}

fn group(count: usize, rate_ms: u64, script: &str) -> ClientGroupConfig {
    ClientGroupConfig {
        id: "load".to_string(),
        count,
        request_rate: Duration::from_millis(rate_ms),
        ramp_up: Duration::ZERO,
        delay: Duration::ZERO,
        behavior_script: script.to_string(),
    }
}

#[tokio::test]
async fn baseline_noop_clients_all_succeed() {
    let sim = Simulation::new(1, EngineConfig::default());
    sim.set_server_behavior(fast_server(0.0));
    sim.set_network_behavior(fast_network(0.0));
    sim.add_client_config(group(10, 100, "")).unwrap();

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    sim.stop().await;

    let snap = sim.snapshot();
    assert!(
        (70..=130).contains(&snap.client_sent_requests),
        "unexpected request volume: {}",
        snap.client_sent_requests
    );
    // Everything resolved at stop time succeeded; at most a handful were
    // still in flight when the run was cancelled
    let unresolved = snap.client_sent_requests - snap.client_success_responses;
    assert!(unresolved <= 10, "too many unresolved requests: {unresolved}");
    assert_eq!(snap.client_blocked_requests, 0);
    assert_eq!(snap.client_retry_requests, 0);
    assert_eq!(snap.client_error_responses, 0);
    assert_eq!(snap.network_failed_requests, 0);
}

#[tokio::test]
async fn full_error_server_fails_every_request() {
    let sim = Simulation::new(2, EngineConfig::default());
    sim.set_server_behavior(fast_server(1.0));
    sim.set_network_behavior(fast_network(0.0));
    sim.add_client_config(group(10, 100, "")).unwrap();

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    sim.stop().await;

    let snap = sim.snapshot();
    assert!(snap.client_sent_requests > 0);
    assert_eq!(snap.client_success_responses, 0);
    // Noop clients never retry
    assert_eq!(snap.client_retry_requests, 0);
    let unresolved = snap.client_sent_requests - snap.client_error_responses;
    assert!(unresolved <= 10, "too many unresolved requests: {unresolved}");
}

#[tokio::test]
async fn five_retry_policy_retries_each_original_five_times() {
    let script = r#"
        fn on_retry(req, resp, err) {
            let meta = req.meta;
            let attempts = if "attempts" in meta { meta.attempts } else { 0 };
            if attempts < 5 {
                meta.attempts = attempts + 1;
                #{allow: true}
            } else {
                #{allow: false}
            }
        }
    "#;

    let sim = Simulation::new(3, EngineConfig::default());
    sim.set_server_behavior(fast_server(1.0));
    sim.set_network_behavior(fast_network(0.0));
    sim.add_client_config(group(5, 100, script)).unwrap();

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    sim.stop().await;

    let snap = sim.snapshot();
    let originals = snap.client_sent_requests - snap.client_retry_requests;
    assert!(originals > 0);
    assert_eq!(snap.client_success_responses, 0);
    // Every original is retried exactly five times, give or take the
    // attempt chain in flight when the run was cancelled
    assert!(snap.client_retry_requests <= originals * 5);
    assert!(
        snap.client_retry_requests >= (originals - 2) * 5,
        "retries {} vs originals {originals}",
        snap.client_retry_requests
    );
}

#[tokio::test]
async fn full_forward_drop_never_reaches_the_server() {
    let sim = Simulation::new(4, EngineConfig::default());
    sim.set_server_behavior(fast_server(0.0));
    sim.set_network_behavior(fast_network(1.0));
    sim.add_client_config(group(10, 100, "")).unwrap();

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    sim.stop().await;

    let snap = sim.snapshot();
    assert!(snap.client_sent_requests > 0);
    assert_eq!(snap.server_received_requests, 0);
    assert_eq!(snap.client_success_responses, 0);
    let unresolved = snap.client_sent_requests - snap.network_failed_requests;
    assert!(unresolved <= 10, "too many unresolved requests: {unresolved}");
}

#[tokio::test]
async fn queue_limited_server_saturates_and_rejects() {
    let mut server = ServerBehavior {
        to: 60,
        response_time_from: 200,
        response_time_to: 200,
        ..ServerBehavior::default()
    };
    server.resource_management_enabled = true;
    server.resource_settings.max_concurrent_requests = 10;
    server.resource_settings.max_queue_size = 20;

    let sim = Simulation::new(5, EngineConfig::default());
    sim.set_server_behavior(server);
    sim.set_network_behavior(fast_network(0.0));
    sim.add_client_config(group(100, 10, "")).unwrap();

    sim.start().unwrap();

    let mut max_threads_util: f64 = 0.0;
    let mut max_queue_util: f64 = 0.0;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = sim.snapshot();
        max_threads_util = max_threads_util.max(snap.server_threads_utilization);
        max_queue_util = max_queue_util.max(snap.server_queue_utilization);
    }
    sim.stop().await;

    let snap = sim.snapshot();
    // Rejections surface to clients as transport errors
    assert!(
        snap.network_failed_requests > 0,
        "expected queue-full rejections"
    );
    assert!(
        max_threads_util >= 0.99,
        "worker pool never saturated: {max_threads_util}"
    );
    assert!(
        max_queue_util >= 0.9,
        "queue never filled up: {max_queue_util}"
    );
}

#[tokio::test]
async fn adaptive_policy_sheds_load_when_the_server_degrades() {
    // Per-client circuit breaker: after three error responses, stop
    // sending altogether
    let script = r#"
        fn set_state() {
            #{failures: 0}
        }
        fn on_request(req) {
            let state = get_state();
            #{allow: state.failures < 3}
        }
        fn on_error(req, resp) {
            let state = get_state();
            state.failures += 1;
        }
    "#;

    let sim = Simulation::new(8, EngineConfig::default());
    sim.set_server_behavior(fast_server(1.0));
    sim.set_network_behavior(fast_network(0.0));
    sim.add_client_config(group(10, 20, script)).unwrap();

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    sim.stop().await;

    let snap = sim.snapshot();
    // Each circuit opens after three errors, so sends stay near
    // 3 per client while blocked requests keep accumulating
    assert!(
        snap.client_sent_requests <= 40,
        "circuit never opened: {} sent",
        snap.client_sent_requests
    );
    assert!(
        snap.client_blocked_requests > snap.client_sent_requests,
        "expected most requests to be shed (blocked {}, sent {})",
        snap.client_blocked_requests,
        snap.client_sent_requests
    );
}

#[tokio::test]
async fn stop_returns_promptly_under_load() {
    let mut server = ServerBehavior {
        to: 60,
        response_time_from: 2_000,
        response_time_to: 2_000,
        ..ServerBehavior::default()
    };
    server.resource_management_enabled = true;
    server.resource_settings.max_concurrent_requests = 5;
    server.resource_settings.max_queue_size = 50;

    let sim = Simulation::new(6, EngineConfig::default());
    sim.set_server_behavior(server);
    sim.set_network_behavior(fast_network(0.0));
    sim.add_client_config(group(50, 20, "")).unwrap();

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stopping = Instant::now();
    sim.stop().await;
    assert!(
        stopping.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        stopping.elapsed()
    );
    assert!(!sim.is_running());

    // Counters are frozen after stop
    let frozen = sim.snapshot().client_sent_requests;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sim.snapshot().client_sent_requests, frozen);
}

#[tokio::test]
async fn restart_replays_curves_from_zero() {
    // Error curve: fails for the first half of the horizon, clean after
    let sim = Simulation::new(7, EngineConfig::default());
    sim.set_server_behavior(ServerBehavior {
        to: 3600,
        response_time_from: 1,
        response_time_to: 1,
        errors: vec![
            BehaviorPoint::brk(0.0, 1.0),
            BehaviorPoint::brk(0.5, 1.0),
            BehaviorPoint::brk(0.500001, 0.0),
            BehaviorPoint::brk(1.0, 0.0),
        ],
        ..ServerBehavior::default()
    });
    sim.set_network_behavior(fast_network(0.0));
    sim.add_client_config(group(5, 50, "")).unwrap();

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    sim.stop().await;
    let first = sim.snapshot();
    assert!(first.client_error_responses > 0);
    assert_eq!(first.client_success_responses, 0);

    // The second run starts inside the failing window again: behavior
    // clocks were reset at stop
    sim.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    sim.stop().await;
    let second = sim.snapshot();
    assert_eq!(second.client_success_responses, 0);
    assert!(second.client_error_responses > first.client_error_responses);
}
