//! The connection capability surface the transaction layer consumes.
//!
//! Statement execution is left to the concrete connection type; this module
//! only describes how a connection enters and leaves transactional mode.

use diesel::PgConnection;
use diesel::connection::{AnsiTransactionManager, TransactionManager};
use diesel::r2d2::{HandleError, ManageConnection};
use diesel::result::QueryResult;

/// A database session whose transaction boundaries are driven through an
/// auto-commit flag.
///
/// In auto-commit mode every statement commits on its own. Turning
/// auto-commit off opens a transaction that stays open until `commit`,
/// `rollback`, or auto-commit is turned back on (which commits).
pub trait TransactionalConnection {
    /// ## Errors
    /// Returns a driver error if the session state cannot be read.
    fn auto_commit(&mut self) -> QueryResult<bool>;

    /// ## Summary
    /// Switches auto-commit mode. Disabling opens a transaction if none is
    /// open; enabling while a transaction is open commits it.
    ///
    /// ## Errors
    /// Returns a driver error if the mode cannot be changed.
    fn set_auto_commit(&mut self, enabled: bool) -> QueryResult<()>;

    /// ## Errors
    /// Returns a driver error if the pending work cannot be committed.
    fn commit(&mut self) -> QueryResult<()>;

    /// ## Errors
    /// Returns a driver error if the pending work cannot be discarded.
    fn rollback(&mut self) -> QueryResult<()>;
}

impl TransactionalConnection for PgConnection {
    fn auto_commit(&mut self) -> QueryResult<bool> {
        let depth = AnsiTransactionManager::transaction_manager_status_mut(self)
            .transaction_depth()?;
        Ok(depth.is_none())
    }

    fn set_auto_commit(&mut self, enabled: bool) -> QueryResult<()> {
        match (enabled, self.auto_commit()?) {
            (false, true) => AnsiTransactionManager::begin_transaction(self),
            (true, false) => AnsiTransactionManager::commit_transaction(self),
            _ => Ok(()),
        }
    }

    fn commit(&mut self) -> QueryResult<()> {
        AnsiTransactionManager::commit_transaction(self)
    }

    fn rollback(&mut self) -> QueryResult<()> {
        AnsiTransactionManager::rollback_transaction(self)
    }
}

/// Connection manager wrapper that refuses to recycle connections left
/// inside an open transaction.
///
/// A connection whose state cannot be read, or which still has auto-commit
/// disabled when it is checked back in, is reported broken so the pool
/// closes it instead of handing it to the next caller.
#[derive(Debug)]
pub struct GuardedManager<M> {
    inner: M,
}

impl<M> GuardedManager<M> {
    #[must_use]
    pub const fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<M> ManageConnection for GuardedManager<M>
where
    M: ManageConnection,
    M::Connection: TransactionalConnection,
{
    type Connection = M::Connection;
    type Error = M::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.inner.connect()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.inner.is_valid(conn)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        if self.inner.has_broken(conn) {
            return true;
        }

        match conn.auto_commit() {
            Ok(true) => false,
            Ok(false) => {
                tracing::debug!("Discarding connection checked in with an open transaction");
                true
            }
            Err(error) => {
                tracing::debug!(%error, "Discarding connection with unreadable state");
                true
            }
        }
    }
}

/// Routes errors from the pool's background connection maintenance to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorHandler;

impl<E> HandleError<E> for TracingErrorHandler
where
    E: std::error::Error,
{
    fn handle_error(&self, error: E) {
        tracing::error!(%error, "Connection pool error");
    }
}
