use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("subscription {0:?} not found")]
    UnknownSubscription(String),

    #[error(transparent)]
    Pool(#[from] pipeline_db::PoolError),

    #[error(transparent)]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
