//! Error types for taskloop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A parameter failed validation before any query was issued.
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// A transaction kept hitting transient contention and the caller
    /// capped the number of attempts.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE codes Postgres raises when two transactions collide on locks.
/// These roll back cleanly and are safe to retry wholesale.
const CONTENTION_SQLSTATES: [&str; 3] = [
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available (lock_timeout expired)
];

/// Whether a storage error is transient lock contention (deadlock or
/// lock-wait timeout) rather than a real failure.
pub fn is_transient_contention(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| CONTENTION_SQLSTATES.contains(&code.as_ref()))
}

impl Error {
    /// Transient contention, seen through the crate error type.
    pub(crate) fn is_contention(&self) -> bool {
        match self {
            Error::Storage(e) => is_transient_contention(e),
            _ => false,
        }
    }
}
