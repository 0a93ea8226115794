//! Connection pool lifecycle and the transactional-mode primitives.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, ManageConnection, Pool, PooledConnection};
use txguard_core::config::{DatabaseConfig, DatabaseDriver, PoolConfig};

use crate::db::connection::{GuardedManager, TracingErrorHandler, TransactionalConnection};
use crate::db::transaction;
use crate::error::{ConnectionError, DbResult, TransactionError};

pub type PgManager = GuardedManager<ConnectionManager<PgConnection>>;
pub type PgPool = ConnectionPool<PgManager>;
pub type DbConnection<M> = PooledConnection<M>;

/// Snapshot of the pool's connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolState {
    pub connections: u32,
    pub idle: u32,
    pub checked_out: u32,
    pub closed: bool,
}

/// A bounded pool of transactional connections.
///
/// Created once at startup and shared by reference; `shutdown` closes the
/// idle connections and makes every later `acquire` fail.
pub struct ConnectionPool<M: ManageConnection> {
    pool: RwLock<Option<Pool<M>>>,
}

impl<M> std::fmt::Debug for ConnectionPool<M>
where
    M: ManageConnection,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("state", &self.state())
            .finish()
    }
}

impl PgPool {
    /// ## Summary
    /// Creates a Postgres connection pool from the database configuration.
    ///
    /// ## Errors
    /// Returns an error if the pool sizing is invalid or the initial idle
    /// connections cannot be established within the connection timeout.
    #[tracing::instrument(skip(config), fields(driver = ?config.driver))]
    pub fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        let DatabaseDriver::Postgres = config.driver;

        let manager = ConnectionManager::<PgConnection>::new(config.connection_url());
        Self::new(GuardedManager::new(manager), &config.pool)
    }
}

impl<M> ConnectionPool<M>
where
    M: ManageConnection,
    M::Connection: TransactionalConnection,
{
    /// ## Summary
    /// Creates a new connection pool around `manager`.
    ///
    /// ## Errors
    /// Returns `ConnectionError::Configuration` if the sizing is invalid and
    /// `ConnectionError::Pool` if the minimum idle connections cannot be opened.
    #[tracing::instrument(
        skip(manager, config),
        fields(max_size = config.max_size, min_idle = config.min_idle)
    )]
    pub fn new(manager: M, config: &PoolConfig) -> DbResult<Self> {
        config.validate()?;

        tracing::debug!("Creating database connection pool");

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .test_on_check_out(false)
            .idle_timeout(non_zero(config.idle_timeout()))
            .max_lifetime(non_zero(config.max_lifetime()))
            .connection_timeout(config.connection_timeout())
            .error_handler(Box::new(TracingErrorHandler))
            .build(manager)?;

        tracing::info!(
            max_size = config.max_size,
            "Database connection pool initialized successfully"
        );

        Ok(Self {
            pool: RwLock::new(Some(pool)),
        })
    }

    /// ## Summary
    /// Checks a connection out of the pool, waiting up to the connection
    /// timeout when every connection is in use.
    ///
    /// ## Errors
    /// Returns `ConnectionError::PoolClosed` after `shutdown`, or
    /// `ConnectionError::Pool` if no connection became available in time.
    pub fn acquire(&self) -> DbResult<DbConnection<M>> {
        let pool = self
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ConnectionError::PoolClosed)?;

        Ok(pool.get()?)
    }

    /// ## Summary
    /// Closes every idle connection. Connections still checked out are closed
    /// when they come back. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(pool) = pool {
            let state = pool.state();
            drop(pool);
            tracing::info!(
                connections = state.connections,
                idle = state.idle_connections,
                "Database connection pool closed"
            );
        } else {
            tracing::debug!("Database connection pool already closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// ## Summary
    /// Runs `unit_of_work` inside a transaction on a connection from this pool.
    ///
    /// ## Errors
    /// See [`transaction::run_in_transaction`].
    pub fn run_in_transaction<T, F>(&self, unit_of_work: F) -> Result<T, TransactionError>
    where
        F: FnOnce(&mut M::Connection) -> anyhow::Result<T>,
    {
        transaction::run_in_transaction(self, unit_of_work)
    }

    /// ## Summary
    /// Runs a side-effect-only `unit_of_work` inside a transaction.
    ///
    /// ## Errors
    /// See [`transaction::run_in_transaction_void`].
    pub fn run_in_transaction_void<F>(&self, unit_of_work: F) -> Result<(), TransactionError>
    where
        F: FnOnce(&mut M::Connection) -> anyhow::Result<()>,
    {
        transaction::run_in_transaction_void(self, unit_of_work)
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    #[must_use]
    pub fn state(&self) -> PoolState {
        let guard = self.pool.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map_or(
            PoolState {
                closed: true,
                ..PoolState::default()
            },
            |pool| {
                let state = pool.state();
                PoolState {
                    connections: state.connections,
                    idle: state.idle_connections,
                    checked_out: state.connections.saturating_sub(state.idle_connections),
                    closed: false,
                }
            },
        )
    }
}

/// ## Summary
/// Puts the connection into transactional mode by disabling auto-commit.
///
/// ## Errors
/// Returns `ConnectionError::Driver` if the mode cannot be changed.
pub fn begin_transaction<C>(conn: &mut C) -> DbResult<()>
where
    C: TransactionalConnection + ?Sized,
{
    conn.set_auto_commit(false)
        .map_err(ConnectionError::driver("begin"))?;
    tracing::debug!("Transaction started");
    Ok(())
}

/// ## Summary
/// Commits pending work and restores auto-commit. Does nothing when the
/// connection is already in auto-commit mode.
///
/// ## Errors
/// Returns `ConnectionError::Driver` if the commit or the mode change fails.
pub fn commit<C>(conn: &mut C) -> DbResult<()>
where
    C: TransactionalConnection + ?Sized,
{
    if conn.auto_commit().map_err(ConnectionError::driver("commit"))? {
        return Ok(());
    }

    conn.commit().map_err(ConnectionError::driver("commit"))?;
    conn.set_auto_commit(true)
        .map_err(ConnectionError::driver("restore auto-commit"))?;
    tracing::debug!("Transaction committed");
    Ok(())
}

/// ## Summary
/// Discards pending work and restores auto-commit. Does nothing when the
/// connection is already in auto-commit mode.
///
/// ## Errors
/// Returns `ConnectionError::Driver` if the rollback or the mode change fails.
pub fn rollback<C>(conn: &mut C) -> DbResult<()>
where
    C: TransactionalConnection + ?Sized,
{
    if conn
        .auto_commit()
        .map_err(ConnectionError::driver("rollback"))?
    {
        return Ok(());
    }

    conn.rollback().map_err(ConnectionError::driver("rollback"))?;
    conn.set_auto_commit(true)
        .map_err(ConnectionError::driver("restore auto-commit"))?;
    tracing::debug!("Transaction rolled back");
    Ok(())
}

/// ## Summary
/// Returns a connection to its pool. A connection that is still inside a
/// transaction, or whose state cannot be read, is logged and closed instead
/// of being recycled. Never fails.
pub fn release<M>(mut conn: DbConnection<M>)
where
    M: ManageConnection,
    M::Connection: TransactionalConnection,
{
    match conn.auto_commit() {
        Ok(true) => tracing::trace!("Connection released"),
        Ok(false) => {
            tracing::error!("Connection released with an open transaction, closing it");
        }
        Err(error) => {
            tracing::error!(%error, "Failed to inspect connection on release, closing it");
        }
    }

    drop(conn);
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
