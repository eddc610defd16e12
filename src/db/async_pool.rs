//! Cooperative pool flavor: acquire suspends the calling task.

use crate::db::connector::AsyncConnector;
use crate::db::pool::{PoolCore, Reserved, Session, SlotGuard};
use crate::error::{DbError, DbResult};
use crate::models::ConnectionMode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct AsyncPool {
    core: Arc<PoolCore>,
    connector: Arc<dyn AsyncConnector>,
    test_before_acquire: bool,
}

impl AsyncPool {
    pub(crate) fn new(
        core: PoolCore,
        connector: Arc<dyn AsyncConnector>,
        test_before_acquire: bool,
    ) -> Self {
        Self {
            core: Arc::new(core),
            connector,
            test_before_acquire,
        }
    }

    pub(crate) fn core(&self) -> &Arc<PoolCore> {
        &self.core
    }

    /// Lease a connection, waiting up to `timeout` for a free slot.
    ///
    /// A zero timeout never waits and fails with `PoolExhausted` when full.
    /// Dropping the returned future at any point gives the slot back.
    pub async fn acquire(&self, timeout: Duration) -> DbResult<Session> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + timeout);

        loop {
            // Register interest before checking, so a release in between is not missed.
            let notified = self.core.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.core.try_reserve()? {
                Some(reserved) => {
                    let guard = SlotGuard::new(Arc::clone(&self.core));
                    return self.fill(guard, reserved, start, deadline).await;
                }
                None if timeout.is_zero() => {
                    return Err(DbError::pool_exhausted(
                        self.core.target(),
                        self.core.capacity(),
                    ));
                }
                None => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(self.core.timed_out(start));
                    }
                }
            }
        }
    }

    async fn fill(
        &self,
        guard: SlotGuard,
        reserved: Reserved,
        start: Instant,
        deadline: tokio::time::Instant,
    ) -> DbResult<Session> {
        if let Reserved::Idle(mut conn) = reserved {
            if !self.test_before_acquire {
                return guard.into_session(conn, false, ConnectionMode::Async);
            }
            match tokio::time::timeout_at(deadline, self.connector.validate(conn.as_mut())).await {
                Ok(Ok(())) => return guard.into_session(conn, false, ConnectionMode::Async),
                Ok(Err(e)) => {
                    warn!(target_name = %self.core.target(), error = %e, "Idle connection failed validation");
                    self.core.discard(conn);
                }
                Err(_) => {
                    self.core.discard(conn);
                    return Err(self.core.timed_out(start));
                }
            }
        }

        match tokio::time::timeout_at(deadline, self.connector.connect()).await {
            Ok(Ok(conn)) => guard.into_session(conn, true, ConnectionMode::Async),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.core.timed_out(start)),
        }
    }

    /// Open idle connections until the pool holds `min_size`. Best effort.
    pub async fn replenish(&self, connect_timeout: Duration) -> usize {
        let mut opened = 0;
        while self.core.reserve_warmup_slot() {
            let slot = SlotGuard::new(Arc::clone(&self.core));
            match tokio::time::timeout(connect_timeout, self.connector.connect()).await {
                Ok(Ok(conn)) => {
                    slot.into_idle(conn);
                    opened += 1;
                }
                Ok(Err(e)) => {
                    debug!(target_name = %self.core.target(), error = %e, "Pool warm-up failed");
                    break;
                }
                Err(_) => break,
            }
        }
        opened
    }
}
