//! Centralized configuration for the simulation engine.
//!
//! Tunable parameters are grouped here to avoid hard-coded values scattered
//! throughout the codebase. Everything has sensible defaults; the control
//! plane only overrides what its caller asks for.

use std::time::Duration;

/// Central configuration for all engine components.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub metrics: MetricsConfig,
    pub behavior: BehaviorConfig,
    pub server: ServerConfig,
    pub emitter: EmitterConfig,
}

/// Metrics registry configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Sliding-window retention for latency and response-time stats
    pub window: Duration,
    /// Maximum number of timed samples kept per window
    pub capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            capacity: 100_000,
        }
    }
}

/// Behavior-script executor configuration.
#[derive(Debug, Clone)]
pub struct BehaviorConfig {
    /// Capacity of the per-client hook work queue. Enqueueing blocks when
    /// full; script correctness depends on every hook firing.
    pub queue_capacity: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
        }
    }
}

/// Server runtime configuration (distinct from [`crate::ServerBehavior`],
/// which is the user-editable scenario).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Resource-manager tick interval
    pub resource_tick: Duration,
    /// Number of queue-time samples kept for the rolling mean
    pub queue_time_samples: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            resource_tick: Duration::from_millis(100),
            queue_time_samples: 100,
        }
    }
}

/// Metrics emitter configuration.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Interval between published snapshots
    pub interval: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
        }
    }
}

/// Defaults for the client group seeded into a fresh simulation.
#[derive(Debug, Clone)]
pub struct DefaultGroupConfig {
    pub count: usize,
    pub request_rate: Duration,
    pub ramp_up: Duration,
    pub delay: Duration,
}

impl Default for DefaultGroupConfig {
    fn default() -> Self {
        Self {
            count: 100,
            request_rate: Duration::from_millis(100),
            ramp_up: Duration::from_secs(3),
            delay: Duration::ZERO,
        }
    }
}
