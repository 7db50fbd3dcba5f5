//! Worker Dispatch Loop (§4.7): claims `JOB_DISPATCHED` notifications off
//! the job-events topic, runs the configured `AgentExecutor`, classifies
//! the result, and drives the job back through `pipeline-jobs`'
//! compare-and-swap transitions.
//!
//! Concurrency is grounded in `orchestrator/engine.rs`'s
//! `task_semaphore`/`JoinSet` fan-out, generalized from draining an
//! in-process task list to polling the event bus for one job at a time per
//! free permit.

use crate::agent::{AgentExecutor, AgentOutcome, ScenesCreated};
use crate::error::{AgentError, WorkerError};
use pipeline_config::WorkerSettings;
use pipeline_eventbus::EventBus;
use pipeline_jobs::JobStore;
use pipeline_ledger::{LedgerStore, NewAssetVersion, OneOrMany};
use pipeline_lock::LockManager;
use pipeline_observability::{emit_event, truncate, ObservabilityEvent};
use pipeline_repo::ProjectRepo;
pub use pipeline_types::event::{CANCELLATIONS_TOPIC, PIPELINE_EVENTS_TOPIC};
use pipeline_types::event::{job_id_from_payload, PipelineEvent};
use pipeline_types::job::{Job, JobState, JobType};
use pipeline_types::project::{Character, Location, Scene};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level};
use uuid::Uuid;

const SUBSCRIPTION_TTL: Duration = Duration::from_secs(10 * 60);
const SUBSCRIPTION_RENEWAL_INTERVAL: Duration = Duration::from_secs(2 * 60);
const IDLE_BACKOFF_FLOOR_MS: u64 = 50;
/// Same lock key/TTL convention `pipeline-handler::CommandHandler` uses
/// (§4.2, §5 "Ordering guarantees") — entity creation is a structural
/// write, not an append-only one, so it takes the project lock rather
/// than relying solely on `pipeline-ledger`'s per-entity locks.
const PROJECT_LOCK_TTL: Duration = Duration::from_secs(30);

fn project_lock_key(project_id: Uuid) -> String {
    format!("project:{project_id}")
}

fn parse_id_array(payload: &serde_json::Value, key: &str) -> Vec<Uuid> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| Uuid::parse_str(s).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Fixed-then-exponential backoff for vendor-signaled rate limiting (§7):
/// the first retry waits a flat second, later ones double up to a ceiling.
fn rate_limit_backoff(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::from_secs(1);
    }
    let exponent = (attempt - 1).min(6);
    Duration::from_millis(1_000 * 2u64.pow(exponent))
}

/// Placeholder sanitation for a safety-filter retry: the real prompt
/// rewriting an agent integration would do is out of scope (§1); this just
/// marks the payload so a `MockAgentExecutor`-style fixture can observe
/// that a retry happened.
fn sanitize_payload(mut payload: serde_json::Value) -> serde_json::Value {
    if let Some(object) = payload.as_object_mut() {
        object.insert("__safety_sanitized".to_string(), serde_json::Value::Bool(true));
    }
    payload
}

/// Everything needed to bring up a `WorkerLoop` for one process.
pub struct WorkerConfig {
    pub worker_id: String,
    pub settings: WorkerSettings,
}

/// Worker Dispatch Loop (§4.7, crate `pipeline-worker`, bin `worker`). One
/// instance per process; `run` drives the full claim/execute/classify
/// cycle until its `CancellationToken` fires.
pub struct WorkerLoop {
    worker_id: String,
    settings: WorkerSettings,
    jobs: Arc<JobStore>,
    ledger: Arc<LedgerStore>,
    repo: Arc<ProjectRepo>,
    locks: Arc<LockManager>,
    bus: Arc<dyn EventBus>,
    agent: Arc<dyn AgentExecutor>,
    /// Jobs this process currently has in flight, keyed by job id, so a
    /// `CANCEL` for a project can find and signal the right in-flight
    /// agent calls (§4.7 item 6, §5 "Cancellation").
    active: Mutex<HashMap<Uuid, (Uuid, CancellationToken)>>,
}

impl WorkerLoop {
    pub fn new(
        config: WorkerConfig,
        jobs: Arc<JobStore>,
        ledger: Arc<LedgerStore>,
        repo: Arc<ProjectRepo>,
        locks: Arc<LockManager>,
        bus: Arc<dyn EventBus>,
        agent: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            worker_id: config.worker_id,
            settings: config.settings,
            jobs,
            ledger,
            repo,
            locks,
            bus,
            agent,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn dispatched_subscription(&self) -> String {
        format!("worker:{}:dispatched", self.worker_id)
    }

    fn cancellations_subscription(&self) -> String {
        format!("worker:{}:cancellations", self.worker_id)
    }

    async fn ensure_subscriptions(&self) -> Result<(), WorkerError> {
        self.bus.ensure_topic(pipeline_jobs::JOB_EVENTS_TOPIC).await?;
        self.bus.ensure_topic(PIPELINE_EVENTS_TOPIC).await?;
        self.bus.ensure_topic(CANCELLATIONS_TOPIC).await?;

        let mut dispatched_filter = HashMap::new();
        dispatched_filter.insert("type".to_string(), "JOB_DISPATCHED".to_string());
        self.bus
            .ensure_subscription(
                &self.dispatched_subscription(),
                pipeline_jobs::JOB_EVENTS_TOPIC,
                dispatched_filter,
                Some(SUBSCRIPTION_TTL),
            )
            .await?;

        let mut cancel_filter = HashMap::new();
        cancel_filter.insert("type".to_string(), "CANCEL".to_string());
        self.bus
            .ensure_subscription(
                &self.cancellations_subscription(),
                CANCELLATIONS_TOPIC,
                cancel_filter,
                Some(SUBSCRIPTION_TTL),
            )
            .await?;
        Ok(())
    }

    fn job_timeout(&self, job_type: JobType) -> Duration {
        match job_type {
            JobType::GenerateSceneVideo | JobType::RenderVideo => {
                Duration::from_millis(self.settings.video_job_timeout_ms)
            }
            _ => Duration::from_millis(self.settings.default_job_timeout_ms),
        }
    }

    fn spawn_renewal_task(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SUBSCRIPTION_RENEWAL_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = worker.ensure_subscriptions().await {
                            tracing::warn!(error = %err, "failed to renew worker subscriptions");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Consumes `CANCEL` broadcasts for this worker's cancellations
    /// subscription, signaling every in-flight job that belongs to the
    /// named project (§4.7 item 6).
    async fn poll_cancellations(&self) -> Result<(), WorkerError> {
        let message = match self.bus.poll(&self.cancellations_subscription()).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if let Some(project_id) = message
            .payload
            .get("projectId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            let active = self.active.lock().unwrap();
            for (job_project_id, token) in active.values() {
                if *job_project_id == project_id {
                    token.cancel();
                }
            }
        }

        self.bus.ack(&self.cancellations_subscription(), message.seq).await?;
        Ok(())
    }

    /// Main loop: acquires a concurrency permit, pulls the next
    /// `JOB_DISPATCHED` message, and spawns its handling on the shared
    /// `JoinSet`. Mirrors `OrchestratorEngine::run_execution_loop`'s
    /// permit-then-spawn shape, pulling from the event bus instead of a
    /// runnable-task scan.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(err) = self.ensure_subscriptions().await {
            tracing::error!(error = %err, "failed to ensure worker subscriptions");
            return;
        }

        let renewal_handle = self.spawn_renewal_task(cancel.clone());
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let backoff = Duration::from_millis(self.settings.claim_poll_backoff_ms.max(IDLE_BACKOFF_FLOOR_MS));

        loop {
            if cancel.is_cancelled() {
                break;
            }

            while join_set.try_join_next().is_some() {}

            if let Err(err) = self.poll_cancellations().await {
                tracing::warn!(error = %err, "cancellation poll failed");
            }

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            let message = match self.bus.poll(&self.dispatched_subscription()).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    tracing::warn!(error = %err, "JOB_DISPATCHED poll failed");
                    continue;
                }
            };

            let Some(job_id) = job_id_from_payload(&message.payload) else {
                if let Err(err) = self.bus.ack(&self.dispatched_subscription(), message.seq).await {
                    tracing::warn!(error = %err, "failed to ack malformed JOB_DISPATCHED");
                }
                drop(permit);
                continue;
            };

            let worker = self.clone();
            let seq = message.seq;
            join_set.spawn(async move {
                let _permit = permit;
                worker.handle_dispatched(job_id, seq).await;
            });
        }

        join_set.abort_all();
        while join_set.join_next().await.is_some() {}
        renewal_handle.abort();

        if let Err(err) = self.bus.delete_subscription(&self.dispatched_subscription()).await {
            tracing::warn!(error = %err, "failed to delete dispatched subscription on shutdown");
        }
        if let Err(err) = self.bus.delete_subscription(&self.cancellations_subscription()).await {
            tracing::warn!(error = %err, "failed to delete cancellations subscription on shutdown");
        }
    }

    /// Ack only after the job has been claimed or deemed unavailable
    /// (§4.7 item 1-2): a claim miss (already taken, cap hit, terminal) is
    /// the normal "someone else has it" outcome, not a reason to
    /// redeliver the dispatch notification.
    async fn handle_dispatched(&self, job_id: Uuid, seq: i64) {
        let claimed = match self.jobs.claim_job(job_id, &self.worker_id).await {
            Ok(claimed) => claimed,
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "claim failed");
                None
            }
        };

        if let Err(err) = self.bus.ack(&self.dispatched_subscription(), seq).await {
            tracing::warn!(error = %err, "failed to ack JOB_DISPATCHED");
        }

        let Some(job) = claimed else {
            return;
        };

        let span = tracing::info_span!(
            "worker_job",
            worker_id = %self.worker_id,
            job_id = %job.id,
            project_id = %job.project_id,
            job_type = %job.job_type,
        );
        self.run_claimed_job(job).instrument(span).await;
    }

    async fn run_claimed_job(&self, job: Job) {
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap();
            active.insert(job.id, (job.project_id, cancel.clone()));
        }

        let heartbeat_handle = self.spawn_heartbeat(job.id, cancel.clone());

        let timeout = self.job_timeout(job.job_type);
        let outcome = match tokio::time::timeout(timeout, self.run_with_retries(&job, cancel.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentError::Transient(format!(
                "job exceeded {}s timeout",
                timeout.as_secs()
            ))),
        };

        cancel.cancel();
        let _ = heartbeat_handle.await;

        {
            let mut active = self.active.lock().unwrap();
            active.remove(&job.id);
        }

        match outcome {
            Ok((outcome, consumed_retries)) => match self.apply_outcome(&job, outcome).await {
                Ok(()) => self.mark_completed(&job, consumed_retries).await,
                Err(err) => {
                    tracing::error!(job_id = %job.id, error = %err, "failed to apply agent outcome");
                    self.mark_failed(&job, AgentError::Transient(err.to_string())).await;
                }
            },
            Err(AgentError::Cancelled) => self.mark_cancelled(&job).await,
            Err(err) => self.mark_failed(&job, err).await,
        }
    }

    fn spawn_heartbeat(&self, job_id: Uuid, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let jobs = self.jobs.clone();
        let interval = Duration::from_millis(self.settings.heartbeat_interval_ms.max(1_000));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = jobs.heartbeat(job_id).await {
                            tracing::debug!(job_id = %job_id, error = %err, "heartbeat failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Runs the agent, absorbing rate-limit and safety-filter errors into
    /// in-process retries per §7: rate limiting backs off and retries up
    /// to `rate_limit_retry_cap` without touching the job's own `attempt`
    /// mid-loop; a safety-filter rejection sanitizes the payload and
    /// retries up to `safety_retries`. Anything else (success, transient,
    /// validation, cancellation) returns straight through.
    ///
    /// Returns the number of in-process retries consumed alongside the
    /// outcome — §8 S5 has a content-filter-then-success run land on
    /// `attempt=2`, so `mark_completed` folds this count into the job's
    /// final `attempt` rather than discarding it the way a mid-loop
    /// `attempt` bump would.
    async fn run_with_retries(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<(AgentOutcome, u32), AgentError> {
        let mut payload = match self.hydrate_payload(job.job_type, job.payload.clone()).await {
            Ok(payload) => payload,
            Err(err) => return Err(AgentError::Transient(err.to_string())),
        };
        let mut safety_attempts = 0u32;
        let mut rate_limit_attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            match self.agent.run(job.job_type, &payload, cancel.clone()).await {
                Ok(outcome) => return Ok((outcome, safety_attempts + rate_limit_attempts)),
                Err(AgentError::Safety(message)) => {
                    safety_attempts += 1;
                    if safety_attempts > self.settings.safety_retries {
                        return Err(AgentError::Safety(message));
                    }
                    tracing::warn!(job_id = %job.id, attempt = safety_attempts, "retrying after safety filter");
                    payload = sanitize_payload(payload);
                }
                Err(AgentError::RateLimit(message)) => {
                    rate_limit_attempts += 1;
                    if rate_limit_attempts > self.settings.rate_limit_retry_cap {
                        return Err(AgentError::Transient(message));
                    }
                    let backoff = rate_limit_backoff(rate_limit_attempts);
                    tracing::warn!(job_id = %job.id, attempt = rate_limit_attempts, backoff_ms = backoff.as_millis() as u64, "backing off after rate limit");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Hydrates the id lists a `GENERATE_CHARACTER_ASSETS`/
    /// `GENERATE_LOCATION_ASSETS` payload carries (`characterIds`/
    /// `locationIds`) into the full rows (`characters`/`locations`), so the
    /// agent sees each entity's current continuity `state` instead of a
    /// bare id. Every other job type passes its payload through unchanged.
    async fn hydrate_payload(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, WorkerError> {
        let mut payload = payload;
        match job_type {
            JobType::GenerateCharacterAssets => {
                let ids = parse_id_array(&payload, "characterIds");
                let characters = self.repo.get_characters_by_ids(&ids).await?;
                payload["characters"] = serde_json::to_value(&characters)?;
            }
            JobType::GenerateLocationAssets => {
                let ids = parse_id_array(&payload, "locationIds");
                let locations = self.repo.get_locations_by_ids(&ids).await?;
                payload["locations"] = serde_json::to_value(&locations)?;
            }
            _ => {}
        }
        Ok(payload)
    }

    /// Persists a storyboard/audio-to-scenes/character/location creation
    /// outcome under the project lock (§5 "Ordering guarantees"): unlike a
    /// ledger append, these touch the whole scene set or upsert character/
    /// location rows, so they take the same lock `pipeline-handler` takes
    /// for structural project writes rather than `pipeline-ledger`'s
    /// per-entity one. A project that already has scenes (e.g. a resumed
    /// pipeline re-running its storyboard stage) goes through
    /// `update_scenes` instead of `create_scenes`, since the rows already
    /// exist and only their partition needs revalidating.
    async fn persist_created_entities(
        &self,
        project_id: Uuid,
        scenes_created: Option<ScenesCreated>,
        characters: Vec<Character>,
        locations: Vec<Location>,
    ) -> Result<(), WorkerError> {
        self.locks
            .with_lock(&project_lock_key(project_id), PROJECT_LOCK_TTL, || async {
                if let Some(created) = scenes_created {
                    let mut project = self.repo.get_project_full_state(project_id).await?;
                    project.metadata.total_duration = created.total_duration;
                    self.repo.update_project(&project).await?;
                    if project.scenes.is_empty() {
                        self.repo.create_scenes(created.total_duration, created.scenes).await?;
                    } else {
                        self.repo.update_scenes(created.total_duration, &created.scenes).await?;
                    }
                }
                if !characters.is_empty() {
                    self.repo.update_characters(&characters).await?;
                }
                if !locations.is_empty() {
                    self.repo.update_locations(&locations).await?;
                }
                Ok(())
            })
            .await
    }

    /// Commits a successful agent run's ledger writes, newly created
    /// scenes/characters/locations, and scene transitions (§4.7 item 4).
    /// Publishes a `SCENE_UPDATE` per touched scene, or a `FULL_STATE` when
    /// the job did not touch any scene — which also covers a
    /// `GENERATE_STORYBOARD`/`PROCESS_AUDIO_TO_SCENES`/
    /// `GENERATE_CHARACTER_ASSETS`/`GENERATE_LOCATION_ASSETS` job, none of
    /// which produce scene transitions of their own.
    async fn apply_outcome(&self, job: &Job, outcome: AgentOutcome) -> Result<(), WorkerError> {
        for write in outcome.ledger_writes {
            self.ledger
                .create_versioned_assets(
                    write.scope,
                    write.entity_id,
                    &write.asset_key,
                    Some(job.id),
                    OneOrMany::One(NewAssetVersion {
                        version_type: write.version_type,
                        data: write.data,
                        metadata: write.metadata,
                        set_best: write.set_best,
                    }),
                )
                .await?;
        }

        if outcome.scenes_created.is_some() || !outcome.characters.is_empty() || !outcome.locations.is_empty() {
            self.persist_created_entities(
                job.project_id,
                outcome.scenes_created,
                outcome.characters,
                outcome.locations,
            )
            .await?;
        }

        if outcome.scene_transitions.is_empty() {
            let project = self.repo.get_project_full_state(job.project_id).await?;
            self.publish_full_state(&project).await?;
            return Ok(());
        }

        for transition in outcome.scene_transitions {
            let mut scene = self.repo.get_scene(job.project_id, transition.scene_id).await?;
            if let Some(status) = transition.status {
                scene.status = status;
            }
            if let Some(continuity_state) = transition.continuity_state {
                scene.continuity_state = continuity_state;
            }
            if transition.error_message.is_some() {
                scene.error_message = transition.error_message;
            }
            self.repo.update_scene_status(&scene).await?;
            self.publish_scene_update(&scene).await?;
        }
        Ok(())
    }

    async fn publish_full_state(&self, project: &pipeline_types::project::Project) -> Result<(), WorkerError> {
        self.bus.ensure_topic(PIPELINE_EVENTS_TOPIC).await?;
        let event = PipelineEvent::FullState { project: project.clone() };
        let mut attributes = HashMap::new();
        attributes.insert("type".to_string(), event.kind().to_string());
        self.bus
            .publish(PIPELINE_EVENTS_TOPIC, attributes, serde_json::to_value(&event)?)
            .await?;
        Ok(())
    }

    async fn publish_scene_update(&self, scene: &Scene) -> Result<(), WorkerError> {
        self.bus.ensure_topic(PIPELINE_EVENTS_TOPIC).await?;
        let event = PipelineEvent::SceneUpdate { scene: scene.clone() };
        let mut attributes = HashMap::new();
        attributes.insert("type".to_string(), event.kind().to_string());
        self.bus
            .publish(PIPELINE_EVENTS_TOPIC, attributes, serde_json::to_value(&event)?)
            .await?;
        Ok(())
    }

    async fn publish_job_event(
        &self,
        job: &Job,
        kind: &str,
        error: Option<&str>,
    ) -> Result<(), WorkerError> {
        self.bus.ensure_topic(pipeline_jobs::JOB_EVENTS_TOPIC).await?;
        let mut attributes = HashMap::new();
        attributes.insert("type".to_string(), kind.to_string());
        let mut payload = serde_json::json!({"jobId": job.id, "projectId": job.project_id});
        if let Some(error) = error {
            payload["error"] = serde_json::Value::String(error.to_string());
        }
        self.bus.publish(pipeline_jobs::JOB_EVENTS_TOPIC, attributes, payload).await?;
        Ok(())
    }

    fn emit_job_event(&self, level: Level, event: &str, job: &Job, status: &str, detail: Option<&str>) {
        let project_id = job.project_id.to_string();
        let job_id = job.id.to_string();
        emit_event(
            level,
            ObservabilityEvent {
                event,
                component: "worker",
                project_id: Some(&project_id),
                job_id: Some(&job_id),
                worker_id: Some(&self.worker_id),
                correlation_id: None,
                status: Some(status),
                detail,
            },
        );
    }

    /// Marks the job `COMPLETED`, folding `consumed_retries` (in-process
    /// safety/rate-limit retries `run_with_retries` absorbed) into the
    /// durable `attempt` count. §8 S5 has a content-filter-then-success run
    /// land on `attempt=2`: the retry itself never bumps `attempt` mid-loop
    /// (so it doesn't eat into `maxRetries`), but the final recorded
    /// `attempt` still needs to reflect that one retry happened.
    async fn mark_completed(&self, job: &Job, consumed_retries: u32) {
        match self.jobs.complete_job(job.id, job.attempt, consumed_retries as i32).await {
            Ok(updated) => {
                if let Err(err) = self.publish_job_event(&updated, "JOB_COMPLETED", None).await {
                    tracing::warn!(error = %err, "failed to publish JOB_COMPLETED");
                }
                self.emit_job_event(Level::INFO, "job_completed", job, "completed", None);
            }
            Err(err) => tracing::warn!(job_id = %job.id, error = %err, "stale write completing job"),
        }
    }

    /// Classifies the terminal agent error into the job-state transition
    /// it drives (§4.7 item 5, §7): transient/rate-limit failures bump
    /// `attempt` and go back to `FAILED` for the lifecycle monitor's retry
    /// sweep; validation errors and safety-filter exhaustion go straight
    /// to `FATAL` since no further automatic retry applies.
    async fn mark_failed(&self, job: &Job, err: AgentError) {
        let message = err.to_string();
        let truncated = truncate(&message, 200);

        let result = match err {
            AgentError::Validation(_) | AgentError::Safety(_) => {
                self.jobs
                    .update_job_safe(job.id, job.attempt, JobState::Fatal, Some(truncated.clone()))
                    .await
            }
            AgentError::Transient(_) | AgentError::RateLimit(_) => {
                self.jobs
                    .update_job_safe_and_increment_attempt(
                        job.id,
                        job.attempt,
                        JobState::Failed,
                        Some(truncated.clone()),
                    )
                    .await
            }
            AgentError::Cancelled => unreachable!("cancellation is handled by mark_cancelled"),
        };

        match result {
            Ok(updated) => {
                if let Err(err) = self.publish_job_event(&updated, "JOB_FAILED", Some(&truncated)).await {
                    tracing::warn!(error = %err, "failed to publish JOB_FAILED");
                }
                let status = updated.state.to_string();
                self.emit_job_event(Level::WARN, "job_failed", job, &status, Some(&truncated));
            }
            Err(err) => tracing::warn!(job_id = %job.id, error = %err, "stale write failing job"),
        }
    }

    async fn mark_cancelled(&self, job: &Job) {
        match self.jobs.update_job_safe(job.id, job.attempt, JobState::Cancelled, None).await {
            Ok(_) => self.emit_job_event(Level::INFO, "job_cancelled", job, "cancelled", None),
            Err(err) => {
                tracing::debug!(job_id = %job.id, error = %err, "stale write cancelling job (already terminal?)")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_from_payload_reads_well_formed_jobid() {
        let id = Uuid::new_v4();
        let payload = serde_json::json!({"jobId": id.to_string(), "projectId": Uuid::new_v4()});
        assert_eq!(job_id_from_payload(&payload), Some(id));
    }

    #[test]
    fn job_id_from_payload_rejects_missing_or_malformed() {
        assert_eq!(job_id_from_payload(&serde_json::json!({})), None);
        assert_eq!(job_id_from_payload(&serde_json::json!({"jobId": "not-a-uuid"})), None);
    }

    #[test]
    fn parse_id_array_reads_uuid_strings() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let payload = serde_json::json!({"characterIds": [a.to_string(), b.to_string()]});
        assert_eq!(parse_id_array(&payload, "characterIds"), vec![a, b]);
    }

    #[test]
    fn parse_id_array_defaults_to_empty_when_missing_or_malformed() {
        assert_eq!(parse_id_array(&serde_json::json!({}), "characterIds"), Vec::<Uuid>::new());
        assert_eq!(
            parse_id_array(&serde_json::json!({"characterIds": "not-an-array"}), "characterIds"),
            Vec::<Uuid>::new()
        );
    }

    #[test]
    fn rate_limit_backoff_is_flat_then_doubles() {
        assert_eq!(rate_limit_backoff(1), Duration::from_secs(1));
        assert_eq!(rate_limit_backoff(2), Duration::from_secs(2));
        assert_eq!(rate_limit_backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn rate_limit_backoff_caps_growth() {
        let at_cap = rate_limit_backoff(50);
        let far_past_cap = rate_limit_backoff(500);
        assert_eq!(at_cap, far_past_cap);
    }

    #[test]
    fn sanitize_payload_marks_object_without_dropping_fields() {
        let sanitized = sanitize_payload(serde_json::json!({"prompt": "a cat"}));
        assert_eq!(sanitized["prompt"], serde_json::json!("a cat"));
        assert_eq!(sanitized["__safety_sanitized"], serde_json::json!(true));
    }
}
