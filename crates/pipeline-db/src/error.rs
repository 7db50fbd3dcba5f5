use thiserror::Error;

/// Errors surfaced by `DbPool::acquire`/`query` (§4.1, §7).
#[derive(Debug, Error)]
pub enum PoolError {
    /// Connection/timeout-class failure; safe to retry with backoff.
    #[error("transient database error: {0}")]
    Transient(String),

    /// The breaker is open; caller should treat this as transient and
    /// back off without attempting the underlying query.
    #[error("circuit breaker open, refusing connection acquisition")]
    BreakerOpen,

    /// A query executed successfully at the transport level but failed
    /// (e.g. constraint violation); not retried by the breaker.
    #[error("query error: {0}")]
    Query(#[from] sqlx::Error),
}

/// Classification used by the circuit breaker to decide whether an error
/// counts toward `errorThreshold` (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ConnectionOrTimeout,
    Other,
}

pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ErrorClass::ConnectionOrTimeout
        }
        sqlx::Error::Database(db_err) => {
            // Postgres connection-exception class (08xxx).
            if db_err.code().is_some_and(|c| c.starts_with("08")) {
                ErrorClass::ConnectionOrTimeout
            } else {
                ErrorClass::Other
            }
        }
        _ => ErrorClass::Other,
    }
}
