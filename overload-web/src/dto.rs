//! JSON DTOs for the control API.
//!
//! Field names follow the dashboard's wire format (`requestRate`, `rtmin`,
//! `latfrom`, ...). Like the UI, the decoder is forgiving: missing fields
//! take their zero values and unknown curve-point types fall back to
//! `curve`.

use std::time::Duration;

use overload_core::curve::PointKind;
use overload_core::server::ResourceSettings;
use overload_core::{BehaviorPoint, ClientGroupConfig, NetworkBehavior, ServerBehavior};
use serde::{Deserialize, Serialize};

/// Simulation status as reported by `GET /api/simulation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SimulationStatus {
    None,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationStatusDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: SimulationStatus,
    #[serde(rename = "startedAt")]
    pub started_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfigDto {
    pub id: String,
    pub count: usize,
    #[serde(rename = "requestRate")]
    pub request_rate: u64,
    #[serde(rename = "rampUpTime")]
    pub ramp_up_time: u64,
    #[serde(rename = "startupDelay")]
    pub startup_delay: u64,
    pub behavior: String,
}

impl From<ClientGroupConfig> for ClientConfigDto {
    fn from(config: ClientGroupConfig) -> Self {
        Self {
            id: config.id,
            count: config.count,
            request_rate: config.request_rate.as_millis() as u64,
            ramp_up_time: config.ramp_up.as_millis() as u64,
            startup_delay: config.delay.as_millis() as u64,
            behavior: config.behavior_script,
        }
    }
}

impl From<ClientConfigDto> for ClientGroupConfig {
    fn from(dto: ClientConfigDto) -> Self {
        Self {
            id: dto.id,
            count: dto.count,
            request_rate: Duration::from_millis(dto.request_rate),
            ramp_up: Duration::from_millis(dto.ramp_up_time),
            delay: Duration::from_millis(dto.startup_delay),
            behavior_script: dto.behavior,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorPointDto {
    pub x: f64,
    pub y: f64,
    /// `"curve"` or `"break"`; anything else is read as `curve`
    #[serde(rename = "type", default = "default_point_type")]
    pub kind: String,
}

fn default_point_type() -> String {
    "curve".to_string()
}

impl From<BehaviorPoint> for BehaviorPointDto {
    fn from(point: BehaviorPoint) -> Self {
        Self {
            x: point.x,
            y: point.y,
            kind: match point.kind {
                PointKind::Curve => "curve".to_string(),
                PointKind::Break => "break".to_string(),
            },
        }
    }
}

impl From<BehaviorPointDto> for BehaviorPoint {
    fn from(dto: BehaviorPointDto) -> Self {
        let kind = match dto.kind.as_str() {
            "break" => PointKind::Break,
            _ => PointKind::Curve,
        };
        BehaviorPoint::new(dto.x, dto.y, kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerResourcesDto {
    #[serde(rename = "maxConcurrentRequests")]
    pub max_concurrent_requests: usize,
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u64,
    #[serde(rename = "maxQueueSize")]
    pub max_queue_size: usize,
    #[serde(rename = "memoryLeakRateMBPerSec")]
    pub memory_leak_rate_mb_per_sec: f64,
    #[serde(rename = "memoryPerRequestMB")]
    pub memory_per_request_mb: f64,
    #[serde(rename = "gcPauseIntervalSec")]
    pub gc_pause_interval_sec: f64,
    #[serde(rename = "gcPauseDurationMs")]
    pub gc_pause_duration_ms: f64,
}

impl Default for ServerResourcesDto {
    fn default() -> Self {
        ResourceSettings::default().into()
    }
}

impl From<ResourceSettings> for ServerResourcesDto {
    fn from(settings: ResourceSettings) -> Self {
        Self {
            max_concurrent_requests: settings.max_concurrent_requests,
            max_memory_mb: settings.max_memory_mb,
            max_queue_size: settings.max_queue_size,
            memory_leak_rate_mb_per_sec: settings.memory_leak_rate_mb_per_sec,
            memory_per_request_mb: settings.memory_per_request_mb,
            gc_pause_interval_sec: settings.gc_pause_interval_sec,
            gc_pause_duration_ms: settings.gc_pause_duration_ms,
        }
    }
}

impl From<ServerResourcesDto> for ResourceSettings {
    fn from(dto: ServerResourcesDto) -> Self {
        Self {
            max_concurrent_requests: dto.max_concurrent_requests,
            max_memory_mb: dto.max_memory_mb,
            max_queue_size: dto.max_queue_size,
            memory_leak_rate_mb_per_sec: dto.memory_leak_rate_mb_per_sec,
            memory_per_request_mb: dto.memory_per_request_mb,
            gc_pause_interval_sec: dto.gc_pause_interval_sec,
            gc_pause_duration_ms: dto.gc_pause_duration_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerBehaviorDto {
    pub to: i64,
    #[serde(rename = "rtfrom")]
    pub response_time_from: i64,
    #[serde(rename = "rtto")]
    pub response_time_to: i64,
    #[serde(rename = "rtmin")]
    pub response_time_min: Vec<BehaviorPointDto>,
    #[serde(rename = "rtmax")]
    pub response_time_max: Vec<BehaviorPointDto>,
    pub errors: Vec<BehaviorPointDto>,
    #[serde(rename = "enableResourceManagement")]
    pub enable_resource_management: bool,
    pub resources: ServerResourcesDto,
}

impl From<ServerBehavior> for ServerBehaviorDto {
    fn from(behavior: ServerBehavior) -> Self {
        Self {
            to: behavior.to,
            response_time_from: behavior.response_time_from,
            response_time_to: behavior.response_time_to,
            response_time_min: behavior.response_time_min.into_iter().map(Into::into).collect(),
            response_time_max: behavior.response_time_max.into_iter().map(Into::into).collect(),
            errors: behavior.errors.into_iter().map(Into::into).collect(),
            enable_resource_management: behavior.resource_management_enabled,
            resources: behavior.resource_settings.into(),
        }
    }
}

impl From<ServerBehaviorDto> for ServerBehavior {
    fn from(dto: ServerBehaviorDto) -> Self {
        Self {
            to: dto.to,
            response_time_from: dto.response_time_from,
            response_time_to: dto.response_time_to,
            response_time_min: dto.response_time_min.into_iter().map(Into::into).collect(),
            response_time_max: dto.response_time_max.into_iter().map(Into::into).collect(),
            errors: dto.errors.into_iter().map(Into::into).collect(),
            resource_management_enabled: dto.enable_resource_management,
            resource_settings: dto.resources.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkBehaviorDto {
    pub to: i64,
    #[serde(rename = "latfrom")]
    pub latency_from: i64,
    #[serde(rename = "latto")]
    pub latency_to: i64,
    #[serde(rename = "drops")]
    pub drop_rate: Vec<BehaviorPointDto>,
    #[serde(rename = "latmin")]
    pub latency_min: Vec<BehaviorPointDto>,
    #[serde(rename = "latmax")]
    pub latency_max: Vec<BehaviorPointDto>,
}

impl From<NetworkBehavior> for NetworkBehaviorDto {
    fn from(behavior: NetworkBehavior) -> Self {
        Self {
            to: behavior.to,
            latency_from: behavior.latency_from,
            latency_to: behavior.latency_to,
            drop_rate: behavior.drop_rate.into_iter().map(Into::into).collect(),
            latency_min: behavior.latency_min.into_iter().map(Into::into).collect(),
            latency_max: behavior.latency_max.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<NetworkBehaviorDto> for NetworkBehavior {
    fn from(dto: NetworkBehaviorDto) -> Self {
        Self {
            to: dto.to,
            latency_from: dto.latency_from,
            latency_to: dto.latency_to,
            drop_rate: dto.drop_rate.into_iter().map(Into::into).collect(),
            latency_min: dto.latency_min.into_iter().map(Into::into).collect(),
            latency_max: dto.latency_max.into_iter().map(Into::into).collect(),
        }
    }
}
