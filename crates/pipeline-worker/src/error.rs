use thiserror::Error;

/// Top-level process error: anything that escapes the per-job loop is a
/// bug, not a job outcome, since every agent error is classified and
/// converted into a job-state update before it gets here (§4.7, §7
/// "Propagation policy").
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Pool(#[from] pipeline_db::PoolError),

    #[error(transparent)]
    Job(#[from] pipeline_jobs::JobError),

    #[error(transparent)]
    Ledger(#[from] pipeline_ledger::LedgerError),

    #[error(transparent)]
    Repo(#[from] pipeline_repo::RepoError),

    #[error(transparent)]
    Bus(#[from] pipeline_eventbus::EventBusError),

    #[error(transparent)]
    Lock(#[from] pipeline_lock::LockError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// The generative-agent error taxonomy (§7). The worker never sees a raw
/// transport error from an agent call; `AgentExecutor` implementations are
/// expected to classify their own failures into one of these on the way
/// out, the same way `OrchestratorEngine::is_rate_limit_error` /
/// `is_provider_quota_error` classify sidecar output in the teacher.
#[derive(Debug, Error, Clone)]
pub enum AgentError {
    /// Network, timeout, or other infrastructure-class failure. Retried
    /// with exponential backoff up to `maxRetries`.
    #[error("transient agent error: {0}")]
    Transient(String),

    /// Vendor-signaled throttling (HTTP 429 or equivalent). Retried with a
    /// fixed-then-exponential backoff that does not count against
    /// `maxRetries` below `rate_limit_retry_cap`.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Content-filter rejection. The worker sanitizes the input and
    /// retries in-process up to `safetyRetries` before giving up.
    #[error("safety filter triggered: {0}")]
    Safety(String),

    /// Malformed/unparseable agent output. Never retried automatically;
    /// terminal as `FATAL` pending a `RESOLVE_INTERVENTION` (§7).
    #[error("validation error: {0}")]
    Validation(String),

    /// The in-flight call observed the cooperative abort signal (§4.7,
    /// §5 "Cancellation"). Not a failure — the caller maps this straight
    /// to `CANCELLED`, never to `FAILED`/`FATAL`.
    #[error("cancelled")]
    Cancelled,
}
