//! Pool core shared by both pool flavors.
//!
//! [`PoolCore`] owns the slot accounting: idle connections, leased sessions and
//! reservations for connections being opened or validated. A slot is reserved
//! under the lock *before* any I/O, so `idle + leased + opening` can never exceed
//! `max_size + max_overflow`, even transiently.
//!
//! Waiters are woken through both a `parking_lot::Condvar` (blocking flavor) and a
//! `tokio::sync::Notify` (async flavor); a pool only ever has one kind of waiter.

use crate::db::async_pool::AsyncPool;
use crate::db::blocking_pool::BlockingPool;
use crate::db::connector::{Connector, RawConnection};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionMode, TargetConfig};
use crate::models::target::validate_pool_bounds;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
    /// Slots reserved for connections being opened or validated.
    pub opening: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub max_overflow: usize,
    /// Connections currently held above `max_size`.
    pub overflow: usize,
    pub closed: bool,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub acquires: u64,
    pub timeouts: u64,
}

struct IdleConnection {
    conn: Box<dyn RawConnection>,
    idle_since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConnection>,
    leased: HashSet<u64>,
    opening: usize,
    min_size: usize,
    max_size: usize,
    max_overflow: usize,
    idle_timeout: Option<Duration>,
    closed: bool,
    next_lease: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.leased.len() + self.opening
    }

    fn capacity(&self) -> usize {
        self.max_size + self.max_overflow
    }
}

/// What a reservation starts with.
pub(crate) enum Reserved {
    /// An idle connection to hand out, possibly after validation.
    Idle(Box<dyn RawConnection>),
    /// An empty slot; the caller must open a connection.
    Open,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    acquires: AtomicU64,
    timeouts: AtomicU64,
}

pub(crate) struct PoolCore {
    target: String,
    id: u64,
    state: Mutex<PoolState>,
    available: Condvar,
    notify: Notify,
    counters: PoolCounters,
}

impl PoolCore {
    pub(crate) fn new(
        target: &str,
        min_size: usize,
        max_size: usize,
        max_overflow: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            target: target.to_string(),
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                leased: HashSet::new(),
                opening: 0,
                min_size,
                max_size,
                max_overflow,
                idle_timeout,
                closed: false,
                next_lease: 1,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
            counters: PoolCounters::default(),
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Try to reserve a slot without waiting.
    ///
    /// `Ok(None)` means the pool is full.
    pub(crate) fn try_reserve(&self) -> DbResult<Option<Reserved>> {
        let mut state = self.state.lock();
        self.reserve_locked(&mut state)
    }

    /// Reserve a slot, blocking the thread until `deadline`.
    pub(crate) fn reserve_blocking(&self, timeout: Duration) -> DbResult<Reserved> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(reserved) = self.reserve_locked(&mut state)? {
                return Ok(reserved);
            }
            if timeout.is_zero() {
                return Err(DbError::pool_exhausted(&self.target, state.capacity()));
            }
            if Instant::now() >= deadline {
                drop(state);
                return Err(self.timed_out(start));
            }
            self.available.wait_until(&mut state, deadline);
        }
    }

    fn reserve_locked(&self, state: &mut PoolState) -> DbResult<Option<Reserved>> {
        if state.closed {
            return Err(DbError::closed(format!("pool for '{}'", self.target)));
        }
        while let Some(idle) = state.idle.pop_front() {
            if state
                .idle_timeout
                .is_some_and(|limit| idle.idle_since.elapsed() > limit)
            {
                self.discard(idle.conn);
                continue;
            }
            state.opening += 1;
            return Ok(Some(Reserved::Idle(idle.conn)));
        }
        if state.total() < state.capacity() {
            state.opening += 1;
            return Ok(Some(Reserved::Open));
        }
        Ok(None)
    }

    /// Turn a reservation into a lease.
    pub(crate) fn commit(&self, fresh: bool) -> DbResult<u64> {
        let mut state = self.state.lock();
        state.opening = state.opening.saturating_sub(1);
        if state.closed {
            drop(state);
            self.wake_one();
            return Err(DbError::closed(format!("pool for '{}'", self.target)));
        }
        let lease_id = state.next_lease;
        state.next_lease += 1;
        state.leased.insert(lease_id);
        drop(state);

        if fresh {
            self.counters.created.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(lease_id)
    }

    /// Give back a reservation that never became a lease.
    pub(crate) fn cancel_reservation(&self) {
        {
            let mut state = self.state.lock();
            state.opening = state.opening.saturating_sub(1);
        }
        self.wake_one();
    }

    /// Put a freshly opened connection straight into the idle set (pool warm-up).
    pub(crate) fn stash_idle(&self, conn: Box<dyn RawConnection>) {
        let rejected = {
            let mut state = self.state.lock();
            state.opening = state.opening.saturating_sub(1);
            if state.closed {
                Some(conn)
            } else {
                state.idle.push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
                None
            }
        };
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        if let Some(conn) = rejected {
            self.discard(conn);
        }
        self.wake_one();
    }

    /// Reserve an empty slot only while the pool holds fewer than `min_size`
    /// connections. Idle connections are left alone.
    pub(crate) fn reserve_warmup_slot(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.total() >= state.min_size.min(state.capacity()) {
            return false;
        }
        state.opening += 1;
        true
    }

    /// Return a leased connection.
    pub(crate) fn release(
        &self,
        pool_id: u64,
        lease_id: u64,
        conn: Box<dyn RawConnection>,
        reusable: bool,
    ) -> DbResult<()> {
        if pool_id != self.id {
            return Err(DbError::ForeignSession {
                target: self.target.clone(),
                lease_id,
            });
        }

        let to_close = {
            let mut state = self.state.lock();
            if !state.leased.remove(&lease_id) {
                return Err(DbError::AlreadyReleased {
                    target: self.target.clone(),
                    lease_id,
                });
            }
            // Overflow connections are not kept once the pool is back under pressure.
            if state.closed || !reusable || state.total() >= state.max_size {
                Some(conn)
            } else {
                state.idle.push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
                None
            }
        };

        if let Some(conn) = to_close {
            self.discard(conn);
        }
        self.wake_one();
        Ok(())
    }

    /// Drain idle connections and refuse new acquires.
    ///
    /// Leased connections are closed when released.
    pub(crate) fn close(&self) {
        let drained: Vec<IdleConnection> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };

        let count = drained.len();
        for idle in drained {
            self.discard(idle.conn);
        }
        self.available.notify_all();
        self.notify.notify_waiters();
        info!(target_name = %self.target, closed_idle = count, "Pool closed");
    }

    pub(crate) fn resize(&self, min_size: usize, max_size: usize) -> DbResult<()> {
        validate_pool_bounds(&self.target, min_size, max_size)?;
        let surplus: Vec<IdleConnection> = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DbError::closed(format!("pool for '{}'", self.target)));
            }
            state.min_size = min_size;
            state.max_size = max_size;
            let mut surplus = Vec::new();
            while state.total() > state.capacity() {
                match state.idle.pop_back() {
                    Some(idle) => surplus.push(idle),
                    None => break,
                }
            }
            surplus
        };

        for idle in surplus {
            self.discard(idle.conn);
        }
        info!(target_name = %self.target, min_size, max_size, "Pool resized");
        // Growth may unblock waiters.
        self.available.notify_all();
        self.notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let held = state.idle.len() + state.leased.len();
        PoolStats {
            in_use: state.leased.len(),
            idle: state.idle.len(),
            opening: state.opening,
            min_size: state.min_size,
            max_size: state.max_size,
            max_overflow: state.max_overflow,
            overflow: held.saturating_sub(state.max_size),
            closed: state.closed,
            connections_created: self.counters.created.load(Ordering::Relaxed),
            connections_closed: self.counters.closed.load(Ordering::Relaxed),
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn timed_out(&self, start: Instant) -> DbError {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        DbError::acquire_timeout(&self.target, start.elapsed())
    }

    pub(crate) fn discard(&self, conn: Box<dyn RawConnection>) {
        drop(conn);
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        debug!(target_name = %self.target, "Connection closed");
    }

    fn wake_one(&self) {
        self.available.notify_one();
        self.notify.notify_one();
    }
}

/// Holds a reserved slot until it is committed into a [`Session`].
///
/// Dropping it (error, timeout, or a cancelled future) returns the slot.
pub(crate) struct SlotGuard {
    core: Arc<PoolCore>,
    armed: bool,
}

impl SlotGuard {
    pub(crate) fn new(core: Arc<PoolCore>) -> Self {
        Self { core, armed: true }
    }

    pub(crate) fn into_session(
        mut self,
        conn: Box<dyn RawConnection>,
        fresh: bool,
        mode: ConnectionMode,
    ) -> DbResult<Session> {
        self.armed = false;
        match self.core.commit(fresh) {
            Ok(lease_id) => Ok(Session {
                target: self.core.target.clone(),
                pool_id: self.core.id,
                lease_id,
                mode,
                conn: Some(conn),
                pool: Arc::clone(&self.core),
                acquired_at: Instant::now(),
            }),
            Err(e) => {
                self.core.discard(conn);
                Err(e)
            }
        }
    }

    pub(crate) fn into_idle(mut self, conn: Box<dyn RawConnection>) {
        self.armed = false;
        self.core.stash_idle(conn);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.core.cancel_reservation();
        }
    }
}

/// A leased connection.
///
/// Release it exactly once with [`Session::release`] (or the manager's
/// `release`). An unreleased session is returned to its pool on drop.
pub struct Session {
    target: String,
    pool_id: u64,
    lease_id: u64,
    mode: ConnectionMode,
    conn: Option<Box<dyn RawConnection>>,
    pool: Arc<PoolCore>,
    acquired_at: Instant,
}

impl Session {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Whether the owning pool has been closed (target removed or manager shut down).
    pub(crate) fn pool_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// How long this session has been leased.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Typed access to the driver connection, for the query layer.
    pub fn connection<T: 'static>(&mut self) -> Option<&mut T> {
        self.conn
            .as_mut()
            .and_then(|conn| conn.as_any_mut().downcast_mut::<T>())
    }

    /// Return the connection to its pool for reuse.
    pub fn release(&mut self) -> DbResult<()> {
        self.give_back(true)
    }

    /// Return the slot but close the connection (e.g. after a driver error).
    pub fn close(&mut self) -> DbResult<()> {
        self.give_back(false)
    }

    fn give_back(&mut self, reusable: bool) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Err(DbError::AlreadyReleased {
                target: self.target.clone(),
                lease_id: self.lease_id,
            });
        };
        self.pool
            .release(self.pool_id, self.lease_id, conn, reusable)
    }

    pub(crate) fn release_into(&mut self, core: &PoolCore) -> DbResult<()> {
        if core.id() != self.pool_id {
            return Err(DbError::ForeignSession {
                target: core.target().to_string(),
                lease_id: self.lease_id,
            });
        }
        self.release()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("lease_id", &self.lease_id)
            .field("mode", &self.mode)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.conn.is_none() {
            return;
        }
        debug!(
            target_name = %self.target,
            lease_id = self.lease_id,
            "Session released via Drop - consider calling release()"
        );
        let _ = self.release();
    }
}

/// One target's pool, in the flavor chosen at registration.
pub enum PoolAdapter {
    Async(AsyncPool),
    Blocking(BlockingPool),
}

impl PoolAdapter {
    /// Build an empty pool for `config`. Connections are opened on demand.
    pub fn new(config: &TargetConfig, connector: Connector) -> DbResult<Self> {
        config.validate()?;
        if connector.mode() != config.mode {
            return Err(DbError::invalid_config(
                &config.id,
                format!(
                    "{} connector cannot serve a target in {} mode",
                    connector.mode(),
                    config.mode
                ),
            ));
        }

        let core = PoolCore::new(
            &config.id,
            config.min_size,
            config.max_size,
            config.max_overflow,
            config.idle_timeout,
        );
        Ok(match connector {
            Connector::Async(c) => {
                Self::Async(AsyncPool::new(core, c, config.test_before_acquire))
            }
            Connector::Blocking(c) => {
                Self::Blocking(BlockingPool::new(core, c, config.test_before_acquire))
            }
        })
    }

    fn core(&self) -> &Arc<PoolCore> {
        match self {
            Self::Async(pool) => pool.core(),
            Self::Blocking(pool) => pool.core(),
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        match self {
            Self::Async(_) => ConnectionMode::Async,
            Self::Blocking(_) => ConnectionMode::Blocking,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.core().id()
    }

    pub fn as_async(&self) -> Option<&AsyncPool> {
        match self {
            Self::Async(pool) => Some(pool),
            Self::Blocking(_) => None,
        }
    }

    pub fn as_blocking(&self) -> Option<&BlockingPool> {
        match self {
            Self::Blocking(pool) => Some(pool),
            Self::Async(_) => None,
        }
    }

    /// Return a session to this pool. Sessions from other pools are rejected.
    pub fn release(&self, session: &mut Session) -> DbResult<()> {
        session.release_into(self.core())
    }

    pub fn resize(&self, min_size: usize, max_size: usize) -> DbResult<()> {
        self.core().resize(min_size, max_size)
    }

    pub fn close(&self) {
        self.core().close()
    }

    pub fn stats(&self) -> PoolStats {
        self.core().stats()
    }
}

impl std::fmt::Debug for PoolAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAdapter")
            .field("mode", &self.mode())
            .field("target", &self.core().target())
            .field("stats", &self.stats())
            .finish()
    }
}
