use thiserror::Error;

/// Application-level errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    TransactionError(#[from] txguard_db::error::TransactionError),
}

pub type AppResult<T> = std::result::Result<T, AppError>;
