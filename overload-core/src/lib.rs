//! Overload Core - client/server request-policy simulation engine
//!
//! This crate provides the building blocks for simulating a client/server
//! request/response flow with a programmable network layer in between:
//! curve-driven behaviors, a sandboxed per-client script interpreter, a
//! server with simulated resource dynamics, and live metrics aggregation.

pub mod behavior;
pub mod client;
pub mod clock;
pub mod config;
pub mod curve;
pub mod events;
pub mod metrics;
pub mod network;
pub mod request;
pub mod server;
pub mod simulation;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use behavior::{ClientBehavior, HookDecision, NoopBehavior, RetryDecision, ScriptBehavior};
pub use config::EngineConfig;
pub use curve::{BehaviorPoint, CurveFn, PointKind};
pub use metrics::{Metrics, MetricsSnapshot, ResourceMetrics};
pub use network::{Network, NetworkBehavior};
pub use request::{Request, Response};
pub use server::{ResourceSettings, Server, ServerBehavior};
pub use simulation::{ClientGroupConfig, Simulation};
pub use tracing_setup::{init_tracing, CliLogLevel};

/// Errors that can surface at the engine boundary.
///
/// Runtime errors stay inside the simulation and manifest through metrics
/// and synthetic responses; only the validation variants reach the control
/// API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SimError {
    /// A behavior-script hook raised; the decision falls back to defaults.
    #[error("script evaluation failed: {reason}")]
    ScriptEvaluation {
        /// Interpreter error message
        reason: String,
    },

    /// Managed-mode admission check rejected the request.
    #[error("server out of memory")]
    ServerOutOfMemory,

    /// The server request queue was at capacity.
    #[error("server queue full")]
    ServerQueueFull,

    /// Synthetic failure sampled from the error-rate curve.
    #[error("server error")]
    ServerError,

    /// The simulated network dropped the packet; no response at all.
    #[error("packet lost")]
    NetworkPacketLost,

    /// Cooperative shutdown; never retried.
    #[error("cancelled")]
    Cancelled,

    /// The client-side timeout fired before a response arrived.
    #[error("client request timed out")]
    ClientTimeout,

    /// The component was already started.
    #[error("already running")]
    AlreadyRunning,

    /// No client group with the given id exists.
    #[error("client group with id '{id}' not found")]
    GroupNotFound {
        /// The requested group id
        id: String,
    },

    /// A client group with the given id already exists.
    #[error("client group with id '{id}' already exists")]
    DuplicateGroup {
        /// The conflicting group id
        id: String,
    },

    /// Client configs can only be mutated while the simulation is stopped.
    #[error("cannot modify client configs while the simulation is running")]
    MutationWhileRunning,
}

impl SimError {
    /// Returns true for cooperative-shutdown errors, which short-circuit
    /// both the hook dispatch and the retry loop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SimError::Cancelled)
    }
}

/// Convenience Result type using SimError as the error type
pub type Result<T> = std::result::Result<T, SimError>;
