//! Physical connection factories.
//!
//! Pools never talk to a driver directly: they ask a connector for a boxed
//! [`RawConnection`]. The async flavor uses sqlx on the caller's runtime. The
//! blocking flavor drives sqlx on a private current-thread runtime so it can be
//! called from plain threads.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionMode, TargetConfig};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

/// A live driver connection owned by a pool slot.
///
/// Dropping it closes the underlying socket.
pub trait RawConnection: Send + 'static {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl RawConnection for PgConnection {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Opens connections for a cooperative (async) pool.
#[async_trait]
pub trait AsyncConnector: Send + Sync + 'static {
    async fn connect(&self) -> DbResult<Box<dyn RawConnection>>;

    /// Check an idle connection before reuse.
    async fn validate(&self, _conn: &mut dyn RawConnection) -> DbResult<()> {
        Ok(())
    }
}

/// Opens connections for a thread-based (blocking) pool.
pub trait BlockingConnector: Send + Sync + 'static {
    /// Must give up with `AcquireTimeout` once `timeout` elapses.
    fn connect(&self, timeout: Duration) -> DbResult<Box<dyn RawConnection>>;

    fn validate(&self, _conn: &mut dyn RawConnection, _timeout: Duration) -> DbResult<()> {
        Ok(())
    }
}

/// Connector for one target, matching the target's mode.
#[derive(Clone)]
pub enum Connector {
    Async(Arc<dyn AsyncConnector>),
    Blocking(Arc<dyn BlockingConnector>),
}

impl Connector {
    /// Build the sqlx connector for a target's mode.
    pub fn postgres(config: &TargetConfig) -> DbResult<Self> {
        match config.mode {
            ConnectionMode::Async => Ok(Self::Async(Arc::new(PgConnector::new(config)?))),
            ConnectionMode::Blocking => {
                Ok(Self::Blocking(Arc::new(BlockingPgConnector::new(config)?)))
            }
        }
    }

    pub fn mode(&self) -> ConnectionMode {
        match self {
            Self::Async(_) => ConnectionMode::Async,
            Self::Blocking(_) => ConnectionMode::Blocking,
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Connector").field(&self.mode()).finish()
    }
}

fn connect_options(config: &TargetConfig) -> DbResult<PgConnectOptions> {
    PgConnectOptions::from_str(&config.driver_connection_string()).map_err(|e| {
        DbError::invalid_config(&config.id, format!("Invalid PostgreSQL connection string: {}", e))
    })
}

/// Async sqlx connector.
#[derive(Debug, Clone)]
pub struct PgConnector {
    target: String,
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(config: &TargetConfig) -> DbResult<Self> {
        Ok(Self {
            target: config.id.clone(),
            options: connect_options(config)?,
        })
    }
}

#[async_trait]
impl AsyncConnector for PgConnector {
    async fn connect(&self) -> DbResult<Box<dyn RawConnection>> {
        let conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| DbError::from_sqlx(&self.target, e))?;
        debug!(target_name = %self.target, "Opened connection");
        Ok(Box::new(conn))
    }

    async fn validate(&self, conn: &mut dyn RawConnection) -> DbResult<()> {
        match conn.as_any_mut().downcast_mut::<PgConnection>() {
            Some(pg) => pg
                .ping()
                .await
                .map_err(|e| DbError::from_sqlx(&self.target, e)),
            None => Err(DbError::internal(format!(
                "Unexpected connection type in pool of '{}'",
                self.target
            ))),
        }
    }
}

/// Owns the private runtime; shut down without blocking so it may be dropped anywhere.
struct DriverRuntime(Option<Runtime>);

impl DriverRuntime {
    fn block_on<F: std::future::Future>(&self, future: F) -> DbResult<F::Output> {
        match &self.0 {
            Some(rt) => Ok(rt.block_on(future)),
            None => Err(DbError::closed("blocking driver runtime")),
        }
    }
}

impl Drop for DriverRuntime {
    fn drop(&mut self) {
        if let Some(rt) = self.0.take() {
            rt.shutdown_background();
        }
    }
}

/// Blocking sqlx connection handed out by [`BlockingPgConnector`].
///
/// Must not be used from inside an async task.
pub struct BlockingPgConnection {
    conn: PgConnection,
    runtime: Arc<DriverRuntime>,
}

impl BlockingPgConnection {
    /// Run a driver operation to completion on the calling thread.
    pub fn block_on<T, F>(&mut self, op: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, T>,
    {
        let runtime = Arc::clone(&self.runtime);
        runtime.block_on(op(&mut self.conn))
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

impl RawConnection for BlockingPgConnection {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Blocking sqlx connector.
pub struct BlockingPgConnector {
    target: String,
    options: PgConnectOptions,
    runtime: Arc<DriverRuntime>,
}

impl BlockingPgConnector {
    pub fn new(config: &TargetConfig) -> DbResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name(format!("pg-blocking-{}", config.id))
            .build()
            .map_err(|e| DbError::internal(format!("Failed to start driver runtime: {}", e)))?;
        Ok(Self {
            target: config.id.clone(),
            options: connect_options(config)?,
            runtime: Arc::new(DriverRuntime(Some(runtime))),
        })
    }
}

impl BlockingConnector for BlockingPgConnector {
    fn connect(&self, timeout: Duration) -> DbResult<Box<dyn RawConnection>> {
        let options = self.options.clone();
        let conn = self
            .runtime
            .block_on(async move {
                tokio::time::timeout(timeout, PgConnection::connect_with(&options)).await
            })?
            .map_err(|_| DbError::acquire_timeout(&self.target, timeout))?
            .map_err(|e| DbError::from_sqlx(&self.target, e))?;
        debug!(target_name = %self.target, "Opened blocking connection");
        Ok(Box::new(BlockingPgConnection {
            conn,
            runtime: Arc::clone(&self.runtime),
        }))
    }

    fn validate(&self, conn: &mut dyn RawConnection, timeout: Duration) -> DbResult<()> {
        let Some(blocking) = conn.as_any_mut().downcast_mut::<BlockingPgConnection>() else {
            return Err(DbError::internal(format!(
                "Unexpected connection type in pool of '{}'",
                self.target
            )));
        };
        let target = self.target.clone();
        blocking
            .block_on(move |pg| {
                Box::pin(async move { tokio::time::timeout(timeout, pg.ping()).await })
            })?
            .map_err(|_| DbError::acquire_timeout(&target, timeout))?
            .map_err(|e| DbError::from_sqlx(&target, e))
    }
}
