use diesel::RunQueryDsl;
use txguard_db::PgPool;

use crate::error::AppResult;

/// ## Summary
/// Round-trips a trivial statement through the full transaction protocol.
///
/// ## Errors
/// Returns an error if a connection cannot be acquired or the statement or
/// commit fails.
#[tracing::instrument(skip(pool))]
pub fn check(pool: &PgPool) -> AppResult<()> {
    pool.run_in_transaction_void(|conn| {
        diesel::sql_query("SELECT 1").execute(conn)?;
        Ok(())
    })?;

    tracing::info!(state = ?pool.state(), "Database health check passed");
    Ok(())
}
