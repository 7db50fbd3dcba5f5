use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("project {0} not found")]
    ProjectNotFound(Uuid),

    #[error("scene {0} not found")]
    SceneNotFound(Uuid),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Repo(#[from] pipeline_repo::RepoError),

    #[error(transparent)]
    Ledger(#[from] pipeline_ledger::LedgerError),

    #[error(transparent)]
    Job(#[from] pipeline_jobs::JobError),

    #[error(transparent)]
    Lock(#[from] pipeline_lock::LockError),

    #[error(transparent)]
    Bus(#[from] pipeline_eventbus::EventBusError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
