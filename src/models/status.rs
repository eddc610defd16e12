//! Status records emitted for external monitoring.

use crate::models::health::{CircuitState, ResourceSnapshot};
use crate::models::target::ConnectionMode;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One target's health and pool usage at snapshot time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub target_name: String,
    pub healthy: bool,
    pub state: CircuitState,
    pub mode: ConnectionMode,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub pool_in_use: usize,
    pub pool_idle: usize,
    pub pool_max: usize,
    pub pool_overflow: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSnapshot>,
}
