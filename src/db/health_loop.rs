//! Background health loop.
//!
//! One tokio task per manager. It holds only a `Weak` reference, so it exits on
//! its own once the manager is dropped. Each tick it samples host resources once,
//! then probes every due target concurrently; a failing or panicking probe never
//! stops the others. Every check is bounded by the manager's probe timeout, and
//! pool warm-up runs in its own task so a slow connect never holds up a round.

use crate::db::manager::{ConnectionManager, TargetEntry};
use crate::db::probe::HealthProbe;
use crate::models::{HealthResult, ResourceSnapshot, ResourceThresholds};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub(crate) struct HealthLoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthLoopHandle {
    pub(crate) fn spawn(
        runtime: &Handle,
        manager: Weak<ConnectionManager>,
        interval: Duration,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = runtime.spawn(run(manager, interval, rx));
        Self { shutdown, task }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop and wait up to `grace` for the current round to finish.
    pub(crate) async fn stop(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => debug!("Health loop stopped"),
            Ok(Err(e)) if e.is_panic() => warn!(error = %e, "Health loop panicked"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Health loop did not stop in time, aborting");
                task.abort();
            }
        }
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

async fn run(manager: Weak<ConnectionManager>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("Health loop received shutdown signal");
                return;
            }
        }

        let Some(manager) = manager.upgrade() else {
            info!("Connection manager dropped, health loop exiting");
            return;
        };
        if manager.is_closed() {
            return;
        }

        let now = Instant::now();
        let due: Vec<Arc<TargetEntry>> = manager
            .entries()
            .into_iter()
            .filter(|entry| entry.probe_due(now))
            .collect();
        if !due.is_empty() {
            run_round(&manager, due).await;
        }

        // Drop the strong reference before sleeping so the manager can be freed
        drop(manager);
    }
}

async fn run_round(manager: &ConnectionManager, due: Vec<Arc<TargetEntry>>) {
    let probe = Arc::clone(manager.probe());
    let resources = Arc::new(sample_resources(Arc::clone(&probe)).await);
    let thresholds = manager.settings().resource_thresholds;
    let probe_timeout = manager.settings().probe_timeout;

    let mut probes = JoinSet::new();
    for entry in due {
        let probe = Arc::clone(&probe);
        let resources = Arc::clone(&resources);
        probes.spawn(async move {
            let reachable =
                probe_entry(probe.as_ref(), &entry, &resources, &thresholds, probe_timeout).await;
            if reachable && entry.pool.as_async().is_some() {
                tokio::spawn(async move { warm_up(&entry).await });
            }
        });
    }

    while let Some(joined) = probes.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Probe task failed");
        }
    }
}

/// Take a resource snapshot on a blocking thread. Failures yield unknown metrics.
pub(crate) async fn sample_resources(probe: Arc<dyn HealthProbe>) -> ResourceSnapshot {
    match tokio::task::spawn_blocking(move || probe.resource_snapshot()).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Resource snapshot failed");
            ResourceSnapshot::unknown()
        }
    }
}

/// Probe one target and apply the result. Returns whether the target answered.
///
/// A check that outlives `timeout` is recorded as unreachable.
pub(crate) async fn probe_entry(
    probe: &dyn HealthProbe,
    entry: &TargetEntry,
    resources: &ResourceSnapshot,
    thresholds: &ResourceThresholds,
    timeout: Duration,
) -> bool {
    let result = match tokio::time::timeout(timeout, probe.check(&entry.config)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(target_name = %entry.name(), timeout_ms = timeout.as_millis() as u64, "Probe timed out");
            HealthResult::unreachable(format!(
                "probe timed out after {}ms",
                timeout.as_millis()
            ))
        }
    };
    entry.apply_probe(&result, resources, thresholds);
    result.reachable
}

/// Top an async pool up to its minimum size. At most one warm-up runs per target.
pub(crate) async fn warm_up(entry: &TargetEntry) {
    let Some(pool) = entry.pool.as_async() else {
        return;
    };
    let Some(_guard) = WarmUpGuard::acquire(&entry.warming) else {
        debug!(target_name = %entry.name(), "Warm-up already running");
        return;
    };
    let opened = pool.replenish(entry.config.acquire_timeout).await;
    if opened > 0 {
        debug!(target_name = %entry.name(), opened, "Pool replenished");
    }
}

struct WarmUpGuard<'a>(&'a AtomicBool);

impl<'a> WarmUpGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then_some(Self(flag))
    }
}

impl Drop for WarmUpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
