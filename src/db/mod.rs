//! Connection management layer.
//!
//! This module provides:
//! - Physical connection factories (async sqlx and blocking sqlx)
//! - Bounded pools in two flavors sharing one slot accounting core
//! - Retry policy with exponential backoff
//! - Reachability and host resource probes
//! - The connection manager, its background health loop and status reporting

pub mod async_pool;
pub mod blocking_pool;
pub mod connector;
mod health_loop;
pub mod manager;
pub mod pool;
pub mod probe;
pub mod retry;
pub mod status;

pub use async_pool::AsyncPool;
pub use blocking_pool::BlockingPool;
pub use connector::{
    AsyncConnector, BlockingConnector, BlockingPgConnection, BlockingPgConnector, Connector,
    PgConnector, RawConnection,
};
pub use manager::{AcquireOptions, ConnectionManager, ManagerSettings};
pub use pool::{PoolAdapter, PoolStats, Session};
pub use probe::{HealthProbe, NetworkProbe};
pub use retry::{RetryAttempt, RetryPolicy, retry_async, retry_blocking};
pub use status::StatusReporter;
