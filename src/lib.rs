//! pg-multipool library
//!
//! Manages a set of named PostgreSQL targets behind one acquire/release API:
//! bounded pools in async and blocking flavors, retry with backoff, a per-target
//! circuit breaker driven by a background health loop, and status snapshots.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{AcquireOptions, ConnectionManager, Session, StatusReporter};
pub use error::{DbError, DbResult};
pub use models::{ConnectionMode, TargetConfig, TargetStatus};
