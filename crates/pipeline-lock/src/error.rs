use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0:?} is held by another holder")]
    Contended(String),

    #[error("lock {0:?} is not held by {1:?}")]
    NotHeld(String, String),

    #[error(transparent)]
    Pool(#[from] pipeline_db::PoolError),

    #[error(transparent)]
    Query(#[from] sqlx::Error),
}
