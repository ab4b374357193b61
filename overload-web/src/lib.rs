//! Overload Web - control plane for the simulation engine
//!
//! Exposes the REST API that manages client groups and server/network
//! behaviors, drives the simulation lifecycle, and streams metrics and
//! lifecycle notifications over WebSockets.

pub mod dashboard;
pub mod dto;
pub mod handlers;
pub mod server;
pub mod ws;

pub use dashboard::{Dashboard, DashboardError};
pub use server::{router, run_server, AppState};
