//! Transaction helper utilities for database operations.
//!
//! ## Usage
//!
//! Wrap the statements that must succeed or fail together in a closure. The
//! closure receives the raw connection and must not commit, roll back, or
//! close it:
//!
//! ```rust,ignore
//! use diesel::prelude::*;
//! use txguard_db::run_in_transaction;
//!
//! let book_id = run_in_transaction(&pool, |conn| {
//!     let id = diesel::insert_into(books::table)
//!         .values(&new_book)
//!         .returning(books::id)
//!         .get_result::<i32>(conn)?;
//!     diesel::update(members::table.find(member_id))
//!         .set(members::loans.eq(members::loans + 1))
//!         .execute(conn)?;
//!     Ok(id)
//! })?;
//! ```

use diesel::r2d2::ManageConnection;

use crate::db::connection::TransactionalConnection;
use crate::db::pool::{self, ConnectionPool, DbConnection};
use crate::error::{TransactionError, TransactionStage};

/// ## Summary
/// Runs `unit_of_work` inside a transaction and returns its result.
///
/// A connection is acquired from `pool`, auto-commit is disabled, the unit of
/// work runs, and the transaction is committed. If beginning, the unit of work,
/// or the commit fails, the transaction is rolled back and the original
/// failure is returned; a failed rollback is only logged. The connection is
/// released exactly once on every path after the acquire succeeded.
///
/// ## Errors
/// Returns a `TransactionError` tagged with the stage that failed and carrying
/// the originating cause.
pub fn run_in_transaction<M, T, F>(
    pool: &ConnectionPool<M>,
    unit_of_work: F,
) -> Result<T, TransactionError>
where
    M: ManageConnection,
    M::Connection: TransactionalConnection,
    F: FnOnce(&mut M::Connection) -> anyhow::Result<T>,
{
    let mut conn = pool.acquire().map_err(|err| {
        let err = TransactionError::new(TransactionStage::Acquire, err);
        tracing::error!(error = %err, "Transaction failed");
        err
    })?;

    let outcome = execute(&mut conn, unit_of_work);

    if let Err(err) = &outcome {
        tracing::error!(stage = %err.stage(), error = %err.cause(), "Transaction failed, rolling back");
        if let Err(rollback_err) = pool::rollback(&mut *conn) {
            tracing::error!(error = %rollback_err, "Rollback failed");
        }
    }

    pool::release(conn);
    outcome
}

/// ## Summary
/// Runs a unit of work that produces no value inside a transaction.
///
/// ## Errors
/// Same as [`run_in_transaction`].
pub fn run_in_transaction_void<M, F>(
    pool: &ConnectionPool<M>,
    unit_of_work: F,
) -> Result<(), TransactionError>
where
    M: ManageConnection,
    M::Connection: TransactionalConnection,
    F: FnOnce(&mut M::Connection) -> anyhow::Result<()>,
{
    run_in_transaction(pool, unit_of_work)
}

fn execute<M, T, F>(conn: &mut DbConnection<M>, unit_of_work: F) -> Result<T, TransactionError>
where
    M: ManageConnection,
    M::Connection: TransactionalConnection,
    F: FnOnce(&mut M::Connection) -> anyhow::Result<T>,
{
    pool::begin_transaction(&mut **conn)
        .map_err(|err| TransactionError::new(TransactionStage::Begin, err))?;

    let value = unit_of_work(&mut **conn)
        .map_err(|err| TransactionError::new(TransactionStage::UnitOfWork, err))?;

    pool::commit(&mut **conn).map_err(|err| TransactionError::new(TransactionStage::Commit, err))?;

    Ok(value)
}
