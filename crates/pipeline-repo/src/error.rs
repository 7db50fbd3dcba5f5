use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("project {0} not found")]
    ProjectNotFound(uuid::Uuid),

    #[error("scene {0} not found")]
    SceneNotFound(uuid::Uuid),

    #[error("invalid scene partition: {0}")]
    InvalidScenePartition(String),

    #[error(transparent)]
    Pool(#[from] pipeline_db::PoolError),

    #[error(transparent)]
    Ledger(#[from] pipeline_ledger::LedgerError),

    #[error(transparent)]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
