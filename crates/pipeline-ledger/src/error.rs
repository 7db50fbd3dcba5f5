use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("version {0} does not exist in ledger")]
    UnknownVersion(u32),

    #[error(transparent)]
    Lock(#[from] pipeline_lock::LockError),

    #[error(transparent)]
    Pool(#[from] pipeline_db::PoolError),

    #[error(transparent)]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
