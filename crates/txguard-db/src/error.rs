use std::fmt;

use thiserror::Error;

/// Failures while obtaining a connection or switching its transactional mode.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Connection pool has been shut down")]
    PoolClosed,

    #[error("Driver error during {operation}: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: diesel::result::Error,
    },

    #[error(transparent)]
    Configuration(#[from] txguard_core::error::CoreError),
}

impl ConnectionError {
    pub(crate) fn driver(operation: &'static str) -> impl FnOnce(diesel::result::Error) -> Self {
        move |source| Self::Driver { operation, source }
    }
}

/// The step of the transaction protocol that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    Acquire,
    Begin,
    UnitOfWork,
    Commit,
}

impl TransactionStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acquire => "acquiring a connection",
            Self::Begin => "beginning the transaction",
            Self::UnitOfWork => "running the unit of work",
            Self::Commit => "committing",
        }
    }
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single failure shape callers see when a transaction did not complete.
///
/// Carries the stage that failed and the originating cause: a
/// [`ConnectionError`] for acquire, begin and commit failures, or whatever the
/// unit of work returned. Rollback and release failures are never reported
/// here.
#[derive(Error, Debug)]
#[error("Database transaction failed while {stage}: {cause}")]
pub struct TransactionError {
    stage: TransactionStage,
    #[source]
    cause: anyhow::Error,
}

impl TransactionError {
    pub(crate) fn new(stage: TransactionStage, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }

    #[must_use]
    pub const fn stage(&self) -> TransactionStage {
        self.stage
    }

    #[must_use]
    pub const fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// Returns the pool or driver failure behind this error, if that is what caused it.
    #[must_use]
    pub fn connection_error(&self) -> Option<&ConnectionError> {
        self.cause.downcast_ref::<ConnectionError>()
    }

    #[must_use]
    pub fn into_cause(self) -> anyhow::Error {
        self.cause
    }
}

pub type DbResult<T> = std::result::Result<T, ConnectionError>;
