//! Connection manager: a registry of named targets, each with its own pool and
//! health state.
//!
//! # Concurrency
//!
//! - The registry is a `parking_lot::RwLock`. It is only held to look up, insert
//!   or remove an `Arc<TargetEntry>`, never across an `.await` or a blocking acquire.
//! - Each target's [`HealthState`] sits behind its own mutex, so probe results
//!   and acquire feedback are applied one at a time per target.
//! - A removed entry stays alive while sessions or in-flight probes hold it; its
//!   pool is already closed, so those finish without touching the registry.

use crate::config::{DEFAULT_PROBE_TIMEOUT_MS, DEFAULT_SHUTDOWN_GRACE_SECS};
use crate::db::connector::Connector;
use crate::db::health_loop::{self, HealthLoopHandle};
use crate::db::pool::{PoolAdapter, PoolStats, Session};
use crate::db::probe::{HealthProbe, NetworkProbe};
use crate::db::retry::{retry_async_within, retry_blocking_within};
use crate::error::{DbError, DbResult};
use crate::models::{
    CircuitPolicy, CircuitState, ConnectionMode, HealthResult, HealthState, ResourceSnapshot,
    ResourceThresholds, TargetConfig,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Host usage above these marks reachable targets degraded.
    pub resource_thresholds: ResourceThresholds,
    /// How long `shutdown` waits for the health loop before aborting it.
    pub shutdown_grace: Duration,
    /// Upper bound on a single health check; a slower check counts as unreachable.
    pub probe_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            resource_thresholds: ResourceThresholds::default(),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
        }
    }
}

/// Per-call acquire overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// Total time for the acquire, retries included. None uses the target's
    /// configured acquire timeout.
    pub timeout: Option<Duration>,
    /// Try the pool even while the circuit is open.
    pub bypass_circuit: bool,
}

impl AcquireOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            bypass_circuit: false,
        }
    }

    pub fn bypassing_circuit(mut self) -> Self {
        self.bypass_circuit = true;
        self
    }
}

/// One registered target.
pub(crate) struct TargetEntry {
    pub(crate) config: TargetConfig,
    pub(crate) pool: PoolAdapter,
    pub(crate) health: Mutex<HealthState>,
    pub(crate) resources: Mutex<Option<ResourceSnapshot>>,
    last_probe: Mutex<Option<Instant>>,
    pub(crate) warming: AtomicBool,
}

impl TargetEntry {
    fn new(config: TargetConfig, connector: Connector) -> DbResult<Self> {
        let pool = PoolAdapter::new(&config, connector)?;
        Ok(Self {
            config,
            pool,
            health: Mutex::new(HealthState::new()),
            resources: Mutex::new(None),
            last_probe: Mutex::new(None),
            warming: AtomicBool::new(false),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.id
    }

    fn circuit_policy(&self) -> CircuitPolicy {
        CircuitPolicy {
            failure_threshold: self.config.failure_threshold(),
            degraded_latency: self.config.degraded_latency,
        }
    }

    /// Whether the loop should probe this target now.
    ///
    /// A failing target is re-probed after its backoff, never later than its interval.
    pub(crate) fn probe_due(&self, now: Instant) -> bool {
        let Some(last) = *self.last_probe.lock() else {
            return true;
        };
        let wait = {
            let health = self.health.lock();
            if health.consecutive_failures > 0 {
                health.backoff.min(self.config.health_check_interval)
            } else {
                self.config.health_check_interval
            }
        };
        now.saturating_duration_since(last) >= wait
    }

    /// Fold a probe outcome into the health state. Returns (previous, current).
    pub(crate) fn apply_probe(
        &self,
        result: &HealthResult,
        resources: &ResourceSnapshot,
        thresholds: &ResourceThresholds,
    ) -> (CircuitState, CircuitState) {
        *self.last_probe.lock() = Some(Instant::now());
        *self.resources.lock() = Some(resources.clone());

        let policy = self.circuit_policy();
        let pressure = resources.pressure(thresholds);
        let (previous, current, failures) = {
            let mut health = self.health.lock();
            let backoff = self
                .config
                .retry
                .base_backoff(health.consecutive_failures.saturating_add(1));
            let previous = health.record_probe(result, pressure, &policy, backoff);
            (previous, health.state, health.consecutive_failures)
        };

        log_transition(self.name(), previous, current, failures, result.error.as_deref());
        (previous, current)
    }

    fn check_circuit(&self, bypass: bool) -> DbResult<()> {
        let health = self.health.lock();
        if health.allows_acquire() {
            return Ok(());
        }
        if bypass && health.state == CircuitState::CircuitOpen {
            debug!(target_name = %self.name(), "Bypassing open circuit");
            return Ok(());
        }
        Err(DbError::unhealthy(self.name(), health.consecutive_failures))
    }

    fn record_acquire<T>(&self, result: &DbResult<T>) {
        match result {
            Ok(_) => self.health.lock().record_acquire_success(),
            Err(e) if e.counts_as_target_failure() => {
                let policy = self.circuit_policy();
                let message = e.to_string();
                let (previous, current, failures) = {
                    let mut health = self.health.lock();
                    let previous = health.record_acquire_failure(&message, &policy);
                    (previous, health.state, health.consecutive_failures)
                };
                log_transition(self.name(), previous, current, failures, Some(&message));
            }
            Err(_) => {}
        }
    }
}

fn log_transition(
    target: &str,
    previous: CircuitState,
    current: CircuitState,
    failures: u32,
    error: Option<&str>,
) {
    if previous == current {
        return;
    }
    match current {
        CircuitState::CircuitOpen => warn!(
            target_name = %target,
            consecutive_failures = failures,
            error = error.unwrap_or_default(),
            "Circuit opened"
        ),
        CircuitState::Healthy if previous == CircuitState::CircuitOpen => {
            info!(target_name = %target, "Circuit closed")
        }
        _ => info!(
            target_name = %target,
            from = %previous,
            to = %current,
            "Target state changed"
        ),
    }
}

/// Registry of named PostgreSQL targets behind one acquire/release API.
pub struct ConnectionManager {
    targets: RwLock<HashMap<String, Arc<TargetEntry>>>,
    probe: Arc<dyn HealthProbe>,
    settings: ManagerSettings,
    closed: AtomicBool,
    health_loop: Mutex<Option<HealthLoopHandle>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Create a manager with the TCP probe and default settings.
    pub fn new() -> Self {
        Self::with_probe(Arc::new(NetworkProbe::default()), ManagerSettings::default())
    }

    pub fn with_probe(probe: Arc<dyn HealthProbe>, settings: ManagerSettings) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            probe,
            settings,
            closed: AtomicBool::new(false),
            health_loop: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::closed("connection manager"));
        }
        Ok(())
    }

    /// Register a target using the sqlx connector for its mode.
    ///
    /// No connection is opened here; the pool fills on demand and after probes.
    pub fn register_target(&self, config: TargetConfig) -> DbResult<()> {
        config.validate()?;
        let connector = Connector::postgres(&config)?;
        self.register_target_with(config, connector)
    }

    /// Register a target with an explicit connector.
    pub fn register_target_with(&self, config: TargetConfig, connector: Connector) -> DbResult<()> {
        self.ensure_open()?;
        config.validate()?;

        // Early check before building anything
        if self.targets.read().contains_key(&config.id) {
            return Err(DbError::duplicate_name(&config.id));
        }

        let name = config.id.clone();
        let uri = config.masked_uri();
        let mode = config.mode;
        let capacity = config.capacity();
        let entry = Arc::new(TargetEntry::new(config, connector)?);

        {
            let mut targets = self.targets.write();
            // Re-check under the write lock; shutdown may also have run meanwhile.
            if self.is_closed() {
                return Err(DbError::closed("connection manager"));
            }
            if targets.contains_key(&name) {
                return Err(DbError::duplicate_name(&name));
            }
            targets.insert(name.clone(), entry);
        }

        info!(target_name = %name, uri = %uri, mode = %mode, capacity, "Target registered");
        Ok(())
    }

    fn entry(&self, name: &str) -> DbResult<Arc<TargetEntry>> {
        self.ensure_open()?;
        self.targets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::unknown_target(name))
    }

    /// Lease a connection from an async target.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> DbResult<Session> {
        self.acquire_with(name, AcquireOptions::with_timeout(timeout))
            .await
    }

    pub async fn acquire_with(&self, name: &str, options: AcquireOptions) -> DbResult<Session> {
        let entry = self.entry(name)?;
        let pool = entry
            .pool
            .as_async()
            .ok_or_else(|| mode_mismatch(name, ConnectionMode::Blocking))?;
        entry.check_circuit(options.bypass_circuit)?;

        let budget = options.timeout.unwrap_or(entry.config.acquire_timeout);
        let result = retry_async_within(&entry.config.retry, name, budget, |_, remaining| {
            pool.acquire(remaining)
        })
        .await;
        entry.record_acquire(&result);
        result
    }

    /// Lease a connection from a blocking target. Blocks the calling thread.
    ///
    /// Call this from plain threads (or `spawn_blocking`), not from async tasks.
    pub fn acquire_blocking(&self, name: &str, timeout: Duration) -> DbResult<Session> {
        self.acquire_blocking_with(name, AcquireOptions::with_timeout(timeout))
    }

    pub fn acquire_blocking_with(&self, name: &str, options: AcquireOptions) -> DbResult<Session> {
        let entry = self.entry(name)?;
        let pool = entry
            .pool
            .as_blocking()
            .ok_or_else(|| mode_mismatch(name, ConnectionMode::Async))?;
        entry.check_circuit(options.bypass_circuit)?;

        let budget = options.timeout.unwrap_or(entry.config.acquire_timeout);
        let result = retry_blocking_within(&entry.config.retry, name, budget, |_, remaining| {
            pool.acquire(remaining)
        });
        entry.record_acquire(&result);
        result
    }

    /// Return a session to its pool.
    ///
    /// A session whose target was removed (or replaced) is still returned to its
    /// own closed pool, which closes the connection.
    pub fn release(&self, session: &mut Session) -> DbResult<()> {
        let entry = self.targets.read().get(session.target()).cloned();
        match entry {
            Some(entry) if entry.pool.id() == session.pool_id() => entry.pool.release(session),
            // Removed or replaced targets have their pools closed
            _ if session.pool_closed() => {
                warn!(
                    target_name = %session.target(),
                    lease_id = session.lease_id(),
                    "Releasing session for a target that is no longer registered"
                );
                session.release()
            }
            _ => {
                warn!(
                    target_name = %session.target(),
                    lease_id = session.lease_id(),
                    "Session belongs to another connection manager, not releasing it"
                );
                Err(DbError::ForeignSession {
                    target: session.target().to_string(),
                    lease_id: session.lease_id(),
                })
            }
        }
    }

    /// Unregister a target and close its pool.
    ///
    /// Idle connections close now; leased ones close when released.
    pub fn remove_target(&self, name: &str) -> DbResult<()> {
        let entry = self
            .targets
            .write()
            .remove(name)
            .ok_or_else(|| DbError::unknown_target(name))?;

        entry.health.lock().mark_removed();
        entry.pool.close();
        info!(target_name = %name, in_use = entry.pool.stats().in_use, "Target removed");
        Ok(())
    }

    /// Change a target's pool bounds.
    pub fn resize_pool(&self, name: &str, min_size: usize, max_size: usize) -> DbResult<()> {
        self.entry(name)?.pool.resize(min_size, max_size)
    }

    /// Start the background health loop. Returns false if one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_health_loop(self: &Arc<Self>, interval: Duration) -> DbResult<bool> {
        self.ensure_open()?;
        if interval.is_zero() {
            return Err(DbError::invalid_config(
                "health-loop",
                "health loop interval must be greater than 0",
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| DbError::internal("health loop requires a tokio runtime"))?;

        let mut slot = self.health_loop.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Health loop already running");
            return Ok(false);
        }
        *slot = Some(HealthLoopHandle::spawn(
            &runtime,
            Arc::downgrade(self),
            interval,
        ));
        info!(interval_ms = interval.as_millis() as u64, "Health loop started");
        Ok(true)
    }

    pub fn health_loop_running(&self) -> bool {
        self.health_loop
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Probe one target now, through the same path as the background loop.
    ///
    /// Unlike the loop, a reachable async target is warmed up before this returns.
    pub async fn probe_now(&self, name: &str) -> DbResult<HealthState> {
        let entry = self.entry(name)?;
        let resources = health_loop::sample_resources(Arc::clone(&self.probe)).await;
        let reachable = health_loop::probe_entry(
            self.probe.as_ref(),
            &entry,
            &resources,
            &self.settings.resource_thresholds,
            self.settings.probe_timeout,
        )
        .await;
        if reachable {
            health_loop::warm_up(&entry).await;
        }
        let health = entry.health.lock().clone();
        Ok(health)
    }

    /// Stop the health loop, close every pool and refuse further use. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Connection manager already shut down");
            return;
        }

        let handle = self.health_loop.lock().take();
        if let Some(handle) = handle {
            handle.stop(self.settings.shutdown_grace).await;
        }

        let drained: Vec<(String, Arc<TargetEntry>)> = self.targets.write().drain().collect();
        for (name, entry) in &drained {
            entry.health.lock().mark_removed();
            entry.pool.close();
            debug!(target_name = %name, "Pool closed on shutdown");
        }
        info!(targets = drained.len(), "Connection manager shut down");
    }

    /// Registered target names, sorted.
    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.read().contains_key(name)
    }

    pub fn target_count(&self) -> usize {
        self.targets.read().len()
    }

    pub fn health(&self, name: &str) -> DbResult<HealthState> {
        let entry = self.entry(name)?;
        let health = entry.health.lock().clone();
        Ok(health)
    }

    pub fn pool_stats(&self, name: &str) -> DbResult<PoolStats> {
        Ok(self.entry(name)?.pool.stats())
    }

    pub(crate) fn probe(&self) -> &Arc<dyn HealthProbe> {
        &self.probe
    }

    /// Snapshot of the registry, taken under a brief read lock.
    pub(crate) fn entries(&self) -> Vec<Arc<TargetEntry>> {
        self.targets.read().values().cloned().collect()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.health_loop.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("targets", &self.target_names())
            .field("closed", &self.is_closed())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn mode_mismatch(name: &str, actual: ConnectionMode) -> DbError {
    let hint = match actual {
        ConnectionMode::Async => "use acquire()",
        ConnectionMode::Blocking => "use acquire_blocking()",
    };
    DbError::invalid_config(name, format!("target uses {} mode; {}", actual, hint))
}
