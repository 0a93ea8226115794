pub mod db;
pub mod error;

pub use db::pool::{ConnectionPool, PgPool};
pub use db::transaction::{run_in_transaction, run_in_transaction_void};
pub use error::{ConnectionError, TransactionError, TransactionStage};
