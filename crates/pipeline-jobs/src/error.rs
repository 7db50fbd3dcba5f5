use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// CAS failure: another writer already advanced this job past the state
    /// or attempt the caller observed. The caller must re-read and decide
    /// whether to retry (§4.5, §7) — this is a signal, not a hard error.
    #[error("stale write: job {0} did not match the expected precondition")]
    StaleWrite(Uuid),

    /// No job matched `claimJob`'s preconditions (already claimed, wrong
    /// state, or retry budget exhausted).
    #[error("job {0} is not claimable")]
    NotClaimable(Uuid),

    #[error(transparent)]
    Pool(#[from] pipeline_db::PoolError),

    #[error(transparent)]
    Bus(#[from] pipeline_eventbus::EventBusError),

    #[error(transparent)]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
