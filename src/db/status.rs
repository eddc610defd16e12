//! Read-only status snapshots for monitoring.

use crate::db::manager::{ConnectionManager, TargetEntry};
use crate::models::TargetStatus;
use std::sync::Arc;

/// Builds [`TargetStatus`] records from a manager without mutating it.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    manager: Arc<ConnectionManager>,
}

impl StatusReporter {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// One record per registered target, sorted by target name.
    pub fn snapshot(&self) -> Vec<TargetStatus> {
        let mut statuses: Vec<TargetStatus> =
            self.manager.entries().iter().map(|e| status_of(e)).collect();
        statuses.sort_by(|a, b| a.target_name.cmp(&b.target_name));
        statuses
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| serde_json::Value::Array(vec![]))
    }
}

fn status_of(entry: &TargetEntry) -> TargetStatus {
    let health = entry.health.lock().clone();
    let resources = entry.resources.lock().clone();
    let stats = entry.pool.stats();

    TargetStatus {
        target_name: entry.name().to_string(),
        healthy: health.is_healthy(),
        state: health.state,
        mode: entry.pool.mode(),
        last_checked_at: health.last_checked_at,
        latency_ms: health.latency.map(|d| d.as_secs_f64() * 1000.0),
        consecutive_failures: health.consecutive_failures,
        last_error: health.last_error,
        pool_in_use: stats.in_use,
        pool_idle: stats.idle,
        pool_max: stats.max_size,
        pool_overflow: stats.overflow,
        resources,
    }
}
