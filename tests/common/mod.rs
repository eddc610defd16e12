//! In-memory connectors and probes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pg_multipool::db::{
    AsyncConnector, BlockingConnector, ConnectionManager, Connector, HealthProbe,
    ManagerSettings, RawConnection, RetryPolicy,
};
use pg_multipool::error::{DbError, DbResult};
use pg_multipool::models::{
    ConnectionMode, HealthResult, ResourceSnapshot, TargetConfig,
};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Connection that reports its own drop.
pub struct FakeConnection {
    live: Arc<AtomicUsize>,
}

impl RawConnection for FakeConnection {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector with switches for failures and latency. Serves both pool flavors.
#[derive(Default)]
pub struct FakeConnector {
    target: String,
    connects: AtomicUsize,
    live: Arc<AtomicUsize>,
    failing: AtomicBool,
    auth_failing: AtomicBool,
    fail_next: AtomicUsize,
    delay_ms: AtomicU64,
}

impl FakeConnector {
    pub fn new(target: &str) -> Arc<Self> {
        Arc::new(Self {
            target: target.to_string(),
            ..Default::default()
        })
    }

    /// Physical connect attempts, successful or not.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_auth_failing(&self, failing: bool) {
        self.auth_failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` connects with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::SeqCst))
    }

    fn open(&self) -> DbResult<Box<dyn RawConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.auth_failing.load(Ordering::SeqCst) {
            return Err(DbError::auth(&self.target, "password authentication failed"));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DbError::transient_network(&self.target, "connection refused"));
        }
        let skipped = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if skipped.is_ok() {
            return Err(DbError::transient_network(&self.target, "connection reset"));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            live: Arc::clone(&self.live),
        }))
    }
}

#[async_trait]
impl AsyncConnector for FakeConnector {
    async fn connect(&self) -> DbResult<Box<dyn RawConnection>> {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.open()
    }
}

impl BlockingConnector for FakeConnector {
    fn connect(&self, timeout: Duration) -> DbResult<Box<dyn RawConnection>> {
        let delay = self.delay();
        if delay > timeout {
            std::thread::sleep(timeout);
            return Err(DbError::acquire_timeout(&self.target, timeout));
        }
        std::thread::sleep(delay);
        self.open()
    }
}

/// Probe whose verdict the test controls.
pub struct FakeProbe {
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    checks: Mutex<Vec<String>>,
    panic_for: Mutex<Option<String>>,
    hang_for: Mutex<Option<String>>,
    resources: Mutex<ResourceSnapshot>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(5),
            checks: Mutex::new(Vec::new()),
            panic_for: Mutex::new(None),
            hang_for: Mutex::new(None),
            resources: Mutex::new(ResourceSnapshot::unknown()),
        }
    }
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the probe of `target` panic.
    pub fn panic_for(&self, target: &str) {
        *self.panic_for.lock() = Some(target.to_string());
    }

    /// Make the check of `target` never answer.
    pub fn hang_for(&self, target: &str) {
        *self.hang_for.lock() = Some(target.to_string());
    }

    pub fn set_resources(&self, cpu: Option<f32>, mem: Option<f32>, disk: Option<f32>) {
        *self.resources.lock() = ResourceSnapshot {
            cpu_percent: cpu,
            mem_percent: mem,
            disk_percent: disk,
            taken_at: Utc::now(),
        };
    }

    pub fn checks_of(&self, target: &str) -> usize {
        self.checks.lock().iter().filter(|t| *t == target).count()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn check(&self, target: &TargetConfig) -> HealthResult {
        self.checks.lock().push(target.id.clone());
        if self.panic_for.lock().as_deref() == Some(target.id.as_str()) {
            panic!("probe of {} exploded", target.id);
        }
        let hangs = self.hang_for.lock().as_deref() == Some(target.id.as_str());
        if hangs {
            std::future::pending::<()>().await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            HealthResult::reachable(Duration::from_millis(self.latency_ms.load(Ordering::SeqCst)))
        } else {
            HealthResult::unreachable(format!("{}:{}: connection refused", target.host, target.port))
        }
    }

    fn resource_snapshot(&self) -> ResourceSnapshot {
        self.resources.lock().clone()
    }
}

/// Target with `max` connections, no overflow and no retries.
pub fn target(name: &str, max: usize) -> TargetConfig {
    TargetConfig::new(name, format!("postgres://app:secret@{}.db.internal:5432/app", name))
        .expect("valid test url")
        .with_pool_size(1, max)
        .with_max_overflow(0)
        .with_retry(RetryPolicy::no_retry())
        .with_health_check_interval(Duration::from_millis(20))
}

pub fn blocking_target(name: &str, max: usize) -> TargetConfig {
    target(name, max).with_mode(ConnectionMode::Blocking)
}

pub fn manager(probe: Arc<FakeProbe>) -> Arc<ConnectionManager> {
    let settings = ManagerSettings {
        shutdown_grace: Duration::from_secs(1),
        ..ManagerSettings::default()
    };
    Arc::new(ConnectionManager::with_probe(probe, settings))
}

/// Register `config` with a fresh fake connector of the matching flavor.
pub fn register(manager: &ConnectionManager, config: TargetConfig) -> Arc<FakeConnector> {
    let fake = FakeConnector::new(&config.id);
    let connector = match config.mode {
        ConnectionMode::Async => Connector::Async(fake.clone()),
        ConnectionMode::Blocking => Connector::Blocking(fake.clone()),
    };
    manager
        .register_target_with(config, connector)
        .expect("registration succeeds");
    fake
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
