use crate::error::JobError;
use pipeline_db::DbPool;
use pipeline_eventbus::EventBus;
use pipeline_types::job::{Job, JobState, JobType, NewJob};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Topic the Job Control Plane publishes dispatch notifications on; workers
/// subscribe filtered to `JOB_DISPATCHED` (§4.8).
pub const JOB_EVENTS_TOPIC: &str = "job-events";

/// Namespace for deriving a job's id from its `uniqueKey` (§4.5). Using a
/// fixed namespace means the same `uniqueKey` always maps to the same id
/// across processes, which is what lets `createJob` be idempotent without
/// a round trip to check for an existing row before inserting.
const JOB_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x3f, 0x1a, 0x9c, 0x2e, 0x77, 0x4b, 0x0d, 0x9a, 0x51, 0x8d, 0x3c, 0x77, 0x12, 0xaa, 0x04,
]);

/// Deterministic id for a job's `uniqueKey`, matching §4.6's
/// `expand:{projectId}`-style templates.
pub fn derive_job_id(unique_key: &str) -> Uuid {
    Uuid::new_v5(&JOB_ID_NAMESPACE, unique_key.as_bytes())
}

/// Job Control Plane store (§4.5): every transition is a single
/// parameterized SQL statement, compare-and-swapped on the column(s) the
/// spec names so a losing writer gets a distinct signal back rather than a
/// torn update.
pub struct JobStore {
    pool: Arc<DbPool>,
    bus: Arc<dyn EventBus>,
}

impl JobStore {
    pub fn new(pool: Arc<DbPool>, bus: Arc<dyn EventBus>) -> Self {
        Self { pool, bus }
    }

    async fn publish_dispatched(&self, job: &Job) -> Result<(), JobError> {
        self.bus.ensure_topic(JOB_EVENTS_TOPIC).await?;
        let mut attributes = HashMap::new();
        attributes.insert("type".to_string(), "JOB_DISPATCHED".to_string());
        self.bus
            .publish(
                JOB_EVENTS_TOPIC,
                attributes,
                serde_json::json!({"jobId": job.id, "projectId": job.project_id}),
            )
            .await?;
        Ok(())
    }

    /// Idempotent: a second call with the same `uniqueKey` returns the
    /// already-created row rather than erroring or duplicating it (§4.5).
    /// Inserted with `attempt = 1`, matching the spec's literal wording.
    pub async fn create_job(&self, new_job: NewJob) -> Result<Job, JobError> {
        let id = derive_job_id(&new_job.unique_key);
        let project_id = new_job.project_id;
        let job_type = new_job.job_type.to_string();
        let unique_key = new_job.unique_key.clone();
        let payload = new_job.payload.clone();
        let max_retries = new_job.max_retries;
        let asset_key = new_job.asset_key.clone();

        self.pool
            .query("jobs::create_job", move |mut conn| async move {
                sqlx::query(
                    r#"
                    INSERT INTO jobs (
                        id, project_id, job_type, payload, state, attempt, max_retries,
                        unique_key, asset_key
                    ) VALUES ($1, $2, $3, $4, 'CREATED', 1, $5, $6, $7)
                    ON CONFLICT (unique_key) DO NOTHING
                    "#,
                )
                .bind(id)
                .bind(project_id)
                .bind(&job_type)
                .bind(&payload)
                .bind(max_retries)
                .bind(&unique_key)
                .bind(&asset_key)
                .execute(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        self.get_job(id).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, JobError> {
        let row: Option<JobRow> = self
            .pool
            .query("jobs::get_job", move |mut conn| async move {
                sqlx::query_as(JOB_SELECT)
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        row.map(JobRow::into_job).ok_or(JobError::NotFound(id))
    }

    pub async fn get_project_jobs(&self, project_id: Uuid) -> Result<Vec<Job>, JobError> {
        let rows: Vec<JobRow> = self
            .pool
            .query("jobs::get_project_jobs", move |mut conn| async move {
                sqlx::query_as(&format!("{JOB_SELECT_BASE} WHERE project_id = $1 ORDER BY created_at"))
                    .bind(project_id)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    /// Transitions `CREATED -> DISPATCHED` and publishes `JOB_DISPATCHED`
    /// (§4.5). Idempotent in effect: a job that is already `DISPATCHED` (a
    /// duplicate command delivery racing itself) is returned unchanged
    /// rather than erroring, since the desired post-state already holds.
    pub async fn dispatch(&self, id: Uuid) -> Result<Job, JobError> {
        let row: Option<JobRow> = self
            .pool
            .query("jobs::dispatch", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    UPDATE jobs SET state = 'DISPATCHED', updated_at = now()
                    WHERE id = $1 AND state = 'CREATED'
                    RETURNING id, project_id, job_type, payload, state, attempt, max_retries,
                        unique_key, asset_key, error, created_at, updated_at, claimed_at,
                        last_heartbeat_at, owner_id
                    "#,
                )
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        let job = match row {
            Some(row) => {
                let job = row.into_job();
                self.publish_dispatched(&job).await?;
                job
            }
            None => self.get_job(id).await?,
        };
        Ok(job)
    }

    /// Atomic compare-and-swap claim (§4.5): `DISPATCHED`, or `FAILED` with
    /// retry budget remaining, swaps to `RUNNING` under `owner_id`. Returns
    /// `None` rather than an error when no row matches — that is the normal
    /// "someone else already claimed it" outcome, not a failure.
    pub async fn claim_job(&self, id: Uuid, owner_id: &str) -> Result<Option<Job>, JobError> {
        let owner_id = owner_id.to_string();
        let row: Option<JobRow> = self
            .pool
            .query("jobs::claim_job", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    UPDATE jobs SET
                        state = 'RUNNING',
                        owner_id = $2,
                        claimed_at = now(),
                        last_heartbeat_at = now(),
                        updated_at = now()
                    WHERE id = $1
                      AND (state = 'DISPATCHED' OR (state = 'FAILED' AND attempt <= max_retries))
                    RETURNING id, project_id, job_type, payload, state, attempt, max_retries,
                        unique_key, asset_key, error, created_at, updated_at, claimed_at,
                        last_heartbeat_at, owner_id
                    "#,
                )
                .bind(id)
                .bind(&owner_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(row.map(JobRow::into_job))
    }

    /// Records a worker is still alive on a claimed job, without touching
    /// `attempt` or `state`.
    pub async fn heartbeat(&self, id: Uuid) -> Result<(), JobError> {
        self.pool
            .query("jobs::heartbeat", move |mut conn| async move {
                sqlx::query("UPDATE jobs SET last_heartbeat_at = now() WHERE id = $1")
                    .bind(id)
                    .execute(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    /// Compare-and-swap on `(id, attempt)`: succeeds only if the row is
    /// still at `expected_attempt`, which is how two writers racing to
    /// finish the same attempt (e.g. a stall sweep and a slow worker) can't
    /// both win (§4.5, §7 property 4). `ownerId` is cleared unconditionally:
    /// it is only ever meaningful while `state = RUNNING`, and every call
    /// here moves the job out of `RUNNING` (§3).
    pub async fn update_job_safe(
        &self,
        id: Uuid,
        expected_attempt: i32,
        new_state: JobState,
        error: Option<String>,
    ) -> Result<Job, JobError> {
        let state = new_state.to_string();
        let row: Option<JobRow> = self
            .pool
            .query("jobs::update_job_safe", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    UPDATE jobs SET state = $3, error = $4, owner_id = NULL, updated_at = now()
                    WHERE id = $1 AND attempt = $2
                    RETURNING id, project_id, job_type, payload, state, attempt, max_retries,
                        unique_key, asset_key, error, created_at, updated_at, claimed_at,
                        last_heartbeat_at, owner_id
                    "#,
                )
                .bind(id)
                .bind(expected_attempt)
                .bind(&state)
                .bind(&error)
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        row.map(JobRow::into_job).ok_or(JobError::StaleWrite(id))
    }

    /// Transitions `DISPATCHED`/`RUNNING` back to `DISPATCHED` unchanged in
    /// `attempt`, used only by the lifecycle monitor's stall sweep (§4.5,
    /// §7 property 6), and re-publishes `JOB_DISPATCHED` so a worker picks
    /// it back up.
    pub async fn requeue_stalled(&self, id: Uuid, expected_attempt: i32) -> Result<Job, JobError> {
        let job = self
            .update_job_safe(id, expected_attempt, JobState::Dispatched, None)
            .await?;
        self.publish_dispatched(&job).await?;
        Ok(job)
    }

    /// Same CAS contract as `update_job_safe`, but also bumps `attempt` —
    /// used when a worker reports a transient failure, so the next claim
    /// attempt and the retry-budget check both see the incremented count.
    pub async fn update_job_safe_and_increment_attempt(
        &self,
        id: Uuid,
        expected_attempt: i32,
        new_state: JobState,
        error: Option<String>,
    ) -> Result<Job, JobError> {
        let state = new_state.to_string();
        let row: Option<JobRow> = self
            .pool
            .query(
                "jobs::update_job_safe_and_increment_attempt",
                move |mut conn| async move {
                    sqlx::query_as(
                        r#"
                        UPDATE jobs SET state = $3, error = $4, attempt = attempt + 1, owner_id = NULL, updated_at = now()
                        WHERE id = $1 AND attempt = $2
                        RETURNING id, project_id, job_type, payload, state, attempt, max_retries,
                            unique_key, asset_key, error, created_at, updated_at, claimed_at,
                            last_heartbeat_at, owner_id
                        "#,
                    )
                    .bind(id)
                    .bind(expected_attempt)
                    .bind(&state)
                    .bind(&error)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
                },
            )
            .await?;
        row.map(JobRow::into_job).ok_or(JobError::StaleWrite(id))
    }

    /// Same CAS contract as `update_job_safe`, transitioning unconditionally
    /// to `COMPLETED`, but also folds `attempt_delta` into `attempt` instead
    /// of leaving it untouched. The worker passes the number of in-process
    /// safety/rate-limit retries a successful run consumed, so a job that
    /// only ever succeeds after one sanitized retry still lands on
    /// `attempt=2` (§8 S5) even though that retry never bumped `attempt`
    /// mid-loop.
    pub async fn complete_job(&self, id: Uuid, expected_attempt: i32, attempt_delta: i32) -> Result<Job, JobError> {
        let row: Option<JobRow> = self
            .pool
            .query("jobs::complete_job", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    UPDATE jobs SET state = 'COMPLETED', attempt = attempt + $3, owner_id = NULL, updated_at = now()
                    WHERE id = $1 AND attempt = $2
                    RETURNING id, project_id, job_type, payload, state, attempt, max_retries,
                        unique_key, asset_key, error, created_at, updated_at, claimed_at,
                        last_heartbeat_at, owner_id
                    "#,
                )
                .bind(id)
                .bind(expected_attempt)
                .bind(attempt_delta)
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        row.map(JobRow::into_job).ok_or(JobError::StaleWrite(id))
    }

    /// Redispatches a `FAILED` job whose backoff has elapsed: `FAILED ->
    /// DISPATCHED`, `attempt` unchanged (it was already bumped on failure),
    /// re-publishing `JOB_DISPATCHED` (§4.5).
    pub async fn redispatch_failed(&self, id: Uuid, expected_attempt: i32) -> Result<Job, JobError> {
        let job = self
            .update_job_safe(id, expected_attempt, JobState::Dispatched, None)
            .await?;
        self.publish_dispatched(&job).await?;
        Ok(job)
    }

    /// `CANCELLED` is reachable from any non-terminal state (§3). Used by
    /// `STOP_PIPELINE` both for a single blocking job and, via
    /// `cancel_project_jobs`, for every outstanding job in a project.
    pub async fn cancel_job(&self, id: Uuid) -> Result<Job, JobError> {
        let row: Option<JobRow> = self
            .pool
            .query("jobs::cancel_job", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    UPDATE jobs SET state = 'CANCELLED', owner_id = NULL, updated_at = now()
                    WHERE id = $1 AND state NOT IN ('COMPLETED', 'FATAL', 'CANCELLED')
                    RETURNING id, project_id, job_type, payload, state, attempt, max_retries,
                        unique_key, asset_key, error, created_at, updated_at, claimed_at,
                        last_heartbeat_at, owner_id
                    "#,
                )
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        match row {
            Some(row) => Ok(row.into_job()),
            None => self.get_job(id).await,
        }
    }

    /// Cancels every non-terminal job belonging to `project_id` — the
    /// `STOP_PIPELINE` effect on queued work (§5 "Cancellation").
    pub async fn cancel_project_jobs(&self, project_id: Uuid) -> Result<Vec<Job>, JobError> {
        let rows: Vec<JobRow> = self
            .pool
            .query("jobs::cancel_project_jobs", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    UPDATE jobs SET state = 'CANCELLED', owner_id = NULL, updated_at = now()
                    WHERE project_id = $1 AND state NOT IN ('COMPLETED', 'FATAL', 'CANCELLED')
                    RETURNING id, project_id, job_type, payload, state, attempt, max_retries,
                        unique_key, asset_key, error, created_at, updated_at, claimed_at,
                        last_heartbeat_at, owner_id
                    "#,
                )
                .bind(project_id)
                .fetch_all(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }
}

const JOB_SELECT_BASE: &str = "SELECT id, project_id, job_type, payload, state, attempt, max_retries, unique_key, asset_key, error, created_at, updated_at, claimed_at, last_heartbeat_at, owner_id FROM jobs";
const JOB_SELECT: &str = "SELECT id, project_id, job_type, payload, state, attempt, max_retries, unique_key, asset_key, error, created_at, updated_at, claimed_at, last_heartbeat_at, owner_id FROM jobs WHERE id = $1";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    project_id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    state: String,
    attempt: i32,
    max_retries: i32,
    unique_key: String,
    asset_key: Option<String>,
    error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    claimed_at: Option<chrono::DateTime<chrono::Utc>>,
    last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    owner_id: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.id,
            project_id: self.project_id,
            job_type: JobType::from_str(&self.job_type).unwrap_or(JobType::FrameRender),
            payload: self.payload,
            state: JobState::from_str(&self.state).unwrap_or(JobState::Fatal),
            attempt: self.attempt,
            max_retries: self.max_retries,
            unique_key: self.unique_key,
            asset_key: self.asset_key,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            claimed_at: self.claimed_at,
            last_heartbeat_at: self.last_heartbeat_at,
            owner_id: self.owner_id,
        }
    }
}
