//! Health models: probe results, host resources, and the per-target circuit state.
//!
//! [`HealthState`] is a plain value type. Every transition is a method on it so
//! the state machine can be exercised without any I/O.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

pub const DEFAULT_CPU_PRESSURE_PERCENT: f32 = 90.0;
pub const DEFAULT_MEMORY_PRESSURE_PERCENT: f32 = 90.0;
pub const DEFAULT_DISK_PRESSURE_PERCENT: f32 = 95.0;

/// Circuit state of a target.
///
/// `Unknown → Healthy ⇄ Degraded → CircuitOpen → Healthy`, with `Removed`
/// reached only through target removal or manager shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Registered, not probed yet. Acquires are allowed.
    Unknown,
    Healthy,
    /// Reachable but slow, under host pressure, or failing below the threshold.
    Degraded,
    /// Acquires fail fast until a probe succeeds.
    CircuitOpen,
    Removed,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::CircuitOpen => "circuit_open",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one reachability check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub reachable: bool,
    pub latency: Option<Duration>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthResult {
    pub fn reachable(latency: Duration) -> Self {
        Self {
            reachable: true,
            latency: Some(latency),
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            latency: None,
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Host resource usage. A metric that could not be read is `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub cpu_percent: Option<f32>,
    pub mem_percent: Option<f32>,
    pub disk_percent: Option<f32>,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn unknown() -> Self {
        Self {
            cpu_percent: None,
            mem_percent: None,
            disk_percent: None,
            taken_at: Utc::now(),
        }
    }

    /// Compare against thresholds. Unknown metrics never count as pressure.
    pub fn pressure(&self, thresholds: &ResourceThresholds) -> ResourcePressure {
        let over = |value: Option<f32>, limit: f32| value.is_some_and(|v| v >= limit);
        ResourcePressure {
            cpu: over(self.cpu_percent, thresholds.cpu_percent),
            memory: over(self.mem_percent, thresholds.memory_percent),
            disk: over(self.disk_percent, thresholds.disk_percent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: DEFAULT_CPU_PRESSURE_PERCENT,
            memory_percent: DEFAULT_MEMORY_PRESSURE_PERCENT,
            disk_percent: DEFAULT_DISK_PRESSURE_PERCENT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourcePressure {
    pub cpu: bool,
    pub memory: bool,
    pub disk: bool,
}

impl ResourcePressure {
    pub fn any(&self) -> bool {
        self.cpu || self.memory || self.disk
    }
}

/// Thresholds that drive state transitions for one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub degraded_latency: Duration,
}

/// Mutable health of one target.
#[derive(Debug, Clone, Serialize)]
pub struct HealthState {
    pub state: CircuitState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub reachable: bool,
    pub latency: Option<Duration>,
    pub consecutive_failures: u32,
    /// Delay before the next probe of a failing target.
    pub backoff: Duration,
    pub pressure: ResourcePressure,
    pub last_error: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Initial state: assumed healthy until the first probe.
    pub fn new() -> Self {
        Self {
            state: CircuitState::Unknown,
            last_checked_at: None,
            reachable: true,
            latency: None,
            consecutive_failures: 0,
            backoff: Duration::ZERO,
            pressure: ResourcePressure::default(),
            last_error: None,
            opened_at: None,
        }
    }

    pub fn allows_acquire(&self) -> bool {
        !matches!(self.state, CircuitState::CircuitOpen | CircuitState::Removed)
    }

    pub fn is_healthy(&self) -> bool {
        matches!(
            self.state,
            CircuitState::Unknown | CircuitState::Healthy | CircuitState::Degraded
        )
    }

    /// Apply a probe outcome. Returns the previous state.
    pub fn record_probe(
        &mut self,
        result: &HealthResult,
        pressure: ResourcePressure,
        policy: &CircuitPolicy,
        backoff: Duration,
    ) -> CircuitState {
        let previous = self.state;
        if previous == CircuitState::Removed {
            return previous;
        }

        self.last_checked_at = Some(result.checked_at);
        self.reachable = result.reachable;
        self.latency = result.latency;
        self.pressure = pressure;

        if result.reachable {
            self.consecutive_failures = 0;
            self.backoff = Duration::ZERO;
            self.last_error = None;
            self.opened_at = None;
            let slow = result
                .latency
                .is_some_and(|latency| latency >= policy.degraded_latency);
            self.state = if slow || pressure.any() {
                CircuitState::Degraded
            } else {
                CircuitState::Healthy
            };
        } else {
            self.last_error = result.error.clone();
            self.register_failure(policy);
            self.backoff = backoff;
        }
        previous
    }

    /// An acquire failed after its retry budget. Returns the previous state.
    pub fn record_acquire_failure(&mut self, error: &str, policy: &CircuitPolicy) -> CircuitState {
        let previous = self.state;
        if previous == CircuitState::Removed {
            return previous;
        }
        self.last_error = Some(error.to_string());
        self.register_failure(policy);
        previous
    }

    /// An acquire succeeded. Only a probe closes an open circuit.
    pub fn record_acquire_success(&mut self) {
        self.consecutive_failures = 0;
        self.backoff = Duration::ZERO;
        if self.state == CircuitState::Degraded && self.reachable && !self.pressure.any() {
            self.state = CircuitState::Healthy;
        }
    }

    pub fn mark_removed(&mut self) {
        self.state = CircuitState::Removed;
    }

    fn register_failure(&mut self, policy: &CircuitPolicy) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= policy.failure_threshold {
            if self.state != CircuitState::CircuitOpen {
                self.opened_at = Some(Utc::now());
            }
            self.state = CircuitState::CircuitOpen;
        } else if self.state != CircuitState::CircuitOpen {
            self.state = CircuitState::Degraded;
        }
    }
}
