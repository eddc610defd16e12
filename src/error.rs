//! Error types for the connection manager.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every acquire-path variant carries the target name so callers can always tell
//! which database failed and why.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid configuration for '{target}': {message}")]
    InvalidConfig { target: String, message: String },

    #[error("Target '{target}' is already registered")]
    DuplicateName { target: String },

    #[error("Unknown target: {target}")]
    UnknownTarget { target: String },

    #[error("Pool exhausted for '{target}': all {capacity} connections are in use")]
    PoolExhausted { target: String, capacity: usize },

    #[error("Acquire timed out for '{target}' after {}ms", elapsed.as_millis())]
    AcquireTimeout { target: String, elapsed: Duration },

    #[error("Target '{target}' is unhealthy: circuit open after {failures} consecutive failures")]
    Unhealthy { target: String, failures: u32 },

    #[error("Closed: {what}")]
    Closed { what: String },

    #[error("Transient network error for '{target}': {message}")]
    TransientNetwork { target: String, message: String },

    #[error("Authentication failed for '{target}': {message}")]
    Auth { target: String, message: String },

    #[error("Driver configuration error for '{target}': {message}")]
    Config { target: String, message: String },

    #[error("Session {lease_id} for '{target}' was already released")]
    AlreadyReleased { target: String, lease_id: u64 },

    #[error("Session {lease_id} does not belong to the pool of '{target}'")]
    ForeignSession { target: String, lease_id: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an invalid configuration error.
    pub fn invalid_config(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a duplicate name error.
    pub fn duplicate_name(target: impl Into<String>) -> Self {
        Self::DuplicateName {
            target: target.into(),
        }
    }

    /// Create an unknown target error.
    pub fn unknown_target(target: impl Into<String>) -> Self {
        Self::UnknownTarget {
            target: target.into(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(target: impl Into<String>, capacity: usize) -> Self {
        Self::PoolExhausted {
            target: target.into(),
            capacity,
        }
    }

    /// Create an acquire timeout error.
    pub fn acquire_timeout(target: impl Into<String>, elapsed: Duration) -> Self {
        Self::AcquireTimeout {
            target: target.into(),
            elapsed,
        }
    }

    /// Create an unhealthy (circuit open) error.
    pub fn unhealthy(target: impl Into<String>, failures: u32) -> Self {
        Self::Unhealthy {
            target: target.into(),
            failures,
        }
    }

    /// Create a closed error.
    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed { what: what.into() }
    }

    /// Create a transient network error.
    pub fn transient_network(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a driver configuration error.
    pub fn config(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::AcquireTimeout { .. } | Self::TransientNetwork { .. }
        )
    }

    /// Whether this failure says something about the target's health.
    ///
    /// Misuse errors (double release, unknown target, bad config) are the
    /// caller's fault and must not count towards opening the circuit.
    pub fn counts_as_target_failure(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::AcquireTimeout { .. }
                | Self::TransientNetwork { .. }
                | Self::Auth { .. }
        )
    }

    /// Name of the target this error refers to, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::InvalidConfig { target, .. }
            | Self::DuplicateName { target }
            | Self::UnknownTarget { target }
            | Self::PoolExhausted { target, .. }
            | Self::AcquireTimeout { target, .. }
            | Self::Unhealthy { target, .. }
            | Self::TransientNetwork { target, .. }
            | Self::Auth { target, .. }
            | Self::Config { target, .. }
            | Self::AlreadyReleased { target, .. }
            | Self::ForeignSession { target, .. } => Some(target),
            Self::Closed { .. } | Self::Internal { .. } => None,
        }
    }

    /// Convert a driver error, attributing it to `target`.
    pub fn from_sqlx(target: impl Into<String>, err: sqlx::Error) -> Self {
        let target = target.into();
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(target, msg.to_string()),
            sqlx::Error::Database(db_err) => {
                // SQLSTATE class 28: invalid authorization specification
                let code = db_err.code().map(|c| c.to_string());
                match code.as_deref() {
                    Some(c) if c.starts_with("28") => DbError::auth(target, db_err.message()),
                    // 3D000: invalid catalog name (database does not exist)
                    Some("3D000") => DbError::config(target, db_err.message()),
                    // 57P03: cannot connect now (server starting up)
                    Some("57P03") | Some("53300") => {
                        DbError::transient_network(target, db_err.message())
                    }
                    _ => DbError::internal(format!(
                        "Database error on '{}': {}",
                        target,
                        db_err.message()
                    )),
                }
            }
            sqlx::Error::PoolTimedOut => DbError::acquire_timeout(target, Duration::ZERO),
            sqlx::Error::PoolClosed => DbError::closed(format!("driver pool for '{}'", target)),
            sqlx::Error::Io(io_err) => {
                DbError::transient_network(target, format!("I/O error: {}", io_err))
            }
            sqlx::Error::Tls(tls_err) => {
                DbError::transient_network(target, format!("TLS error: {}", tls_err))
            }
            sqlx::Error::Protocol(msg) => {
                DbError::transient_network(target, format!("Protocol error: {}", msg))
            }
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            other => DbError::internal(format!("Unknown database error on '{}': {}", target, other)),
        }
    }
}

/// Result type alias for connection manager operations.
pub type DbResult<T> = Result<T, DbError>;
