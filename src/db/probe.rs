//! Health probes: endpoint reachability plus host resource sampling.
//!
//! Probes never fail their caller. An unreachable endpoint is reported in the
//! [`HealthResult`], and a metric that cannot be read is left as `None`.

use crate::config::DEFAULT_PROBE_TIMEOUT_MS;
use crate::models::{HealthResult, ResourceSnapshot, TargetConfig};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::Path;
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tokio::net::TcpStream;
use tracing::debug;

/// Health check used by the manager's background loop and `probe_now`.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Check whether the target's endpoint answers.
    async fn check(&self, target: &TargetConfig) -> HealthResult;

    /// Sample host CPU, memory and disk usage. May block briefly.
    fn resource_snapshot(&self) -> ResourceSnapshot;
}

/// TCP reachability probe with `sysinfo` resource sampling.
pub struct NetworkProbe {
    timeout: Duration,
    system: Mutex<SystemSampler>,
}

struct SystemSampler {
    system: System,
    /// CPU usage needs two refreshes to be meaningful.
    cpu_primed: bool,
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS))
    }
}

impl NetworkProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            system: Mutex::new(SystemSampler {
                system: System::new(),
                cpu_primed: false,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    async fn check(&self, target: &TargetConfig) -> HealthResult {
        let address = format!("{}:{}", target.host, target.port);
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => {
                let latency = start.elapsed();
                debug!(target_name = %target.id, latency_ms = latency.as_millis() as u64, "Probe succeeded");
                HealthResult::reachable(latency)
            }
            Ok(Err(e)) => {
                debug!(target_name = %target.id, error = %e, "Probe failed");
                HealthResult::unreachable(format!("{}: {}", address, e))
            }
            Err(_) => {
                debug!(target_name = %target.id, "Probe timed out");
                HealthResult::unreachable(format!(
                    "{}: timed out after {}ms",
                    address,
                    self.timeout.as_millis()
                ))
            }
        }
    }

    fn resource_snapshot(&self) -> ResourceSnapshot {
        let mut sampler = self.system.lock();

        sampler.system.refresh_cpu_usage();
        let cpu_percent = if sampler.cpu_primed && !sampler.system.cpus().is_empty() {
            Some(sampler.system.global_cpu_usage())
        } else {
            None
        };
        sampler.cpu_primed = true;

        sampler.system.refresh_memory();
        let total = sampler.system.total_memory();
        let mem_percent = (total > 0)
            .then(|| (sampler.system.used_memory() as f64 / total as f64 * 100.0) as f32);
        drop(sampler);

        ResourceSnapshot {
            cpu_percent: cpu_percent.filter(|v| v.is_finite()),
            mem_percent,
            disk_percent: disk_usage_percent(),
            taken_at: Utc::now(),
        }
    }
}

/// Usage of the disk holding the working directory, else of the largest disk.
fn disk_usage_percent() -> Option<f32> {
    let disks = Disks::new_with_refreshed_list();
    let cwd = std::env::current_dir().ok();

    let by_cwd = cwd.as_deref().and_then(|cwd| {
        disks
            .iter()
            .filter(|d| cwd.starts_with(d.mount_point()))
            .max_by_key(|d| mount_depth(d.mount_point()))
    });
    let disk = by_cwd.or_else(|| disks.iter().max_by_key(|d| d.total_space()))?;

    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(disk.available_space());
    Some((used as f64 / total as f64 * 100.0) as f32)
}

fn mount_depth(path: &Path) -> usize {
    path.components().count()
}
