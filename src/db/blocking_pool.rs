//! Thread-based pool flavor: acquire blocks the calling thread.
//!
//! Do not call into this pool from an async task; use the async flavor there.

use crate::db::connector::BlockingConnector;
use crate::db::pool::{PoolCore, Reserved, Session, SlotGuard};
use crate::error::DbResult;
use crate::models::ConnectionMode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct BlockingPool {
    core: Arc<PoolCore>,
    connector: Arc<dyn BlockingConnector>,
    test_before_acquire: bool,
}

impl BlockingPool {
    pub(crate) fn new(
        core: PoolCore,
        connector: Arc<dyn BlockingConnector>,
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

    /// Lease a connection, blocking up to `timeout` for a free slot.
    pub fn acquire(&self, timeout: Duration) -> DbResult<Session> {
        let start = Instant::now();
        let reserved = self.core.reserve_blocking(timeout)?;
        let guard = SlotGuard::new(Arc::clone(&self.core));

        if let Reserved::Idle(mut conn) = reserved {
            if !self.test_before_acquire {
                return guard.into_session(conn, false, ConnectionMode::Blocking);
            }
            let remaining = remaining(start, timeout);
            if remaining.is_zero() {
                self.core.discard(conn);
                return Err(self.core.timed_out(start));
            }
            match self.connector.validate(conn.as_mut(), remaining) {
                Ok(()) => return guard.into_session(conn, false, ConnectionMode::Blocking),
                Err(e) => {
                    warn!(target_name = %self.core.target(), error = %e, "Idle connection failed validation");
                    self.core.discard(conn);
                }
            }
        }

        let remaining = remaining(start, timeout);
        if remaining.is_zero() {
            return Err(self.core.timed_out(start));
        }
        let conn = self.connector.connect(remaining)?;
        guard.into_session(conn, true, ConnectionMode::Blocking)
    }

    /// Open idle connections until the pool holds `min_size`. Best effort.
    pub fn replenish(&self, connect_timeout: Duration) -> usize {
        let mut opened = 0;
        while self.core.reserve_warmup_slot() {
            let slot = SlotGuard::new(Arc::clone(&self.core));
            match self.connector.connect(connect_timeout) {
                Ok(conn) => {
                    slot.into_idle(conn);
                    opened += 1;
                }
                Err(e) => {
                    debug!(target_name = %self.core.target(), error = %e, "Pool warm-up failed");
                    break;
                }
            }
        }
        opened
    }
}

fn remaining(start: Instant, timeout: Duration) -> Duration {
    timeout.saturating_sub(start.elapsed())
}
