//! `CommandHandler` (§4.6): one instance per process, consuming the
//! commands topic and the job-completion half of the job-events topic.
//! Grounded on `orchestrator/engine.rs`'s phase-based `start()` /
//! `run_planning_phase()` and `orchestrator/scheduler.rs`'s
//! `all_completed`/`any_failed`/`get_all_runnable`, generalized from a
//! single in-process DAG to cross-process job rows.

use crate::error::HandlerError;
use crate::stages::{scene_video_unit, stage_order, stage_status, work_units, StageStatus, WorkUnit};
use pipeline_eventbus::EventBus;
use pipeline_jobs::JobStore;
use pipeline_ledger::{LedgerStore, Scope};
use pipeline_lock::LockManager;
use pipeline_repo::ProjectRepo;
use pipeline_types::command::{Command, FrameType, InterventionAction};
pub use pipeline_types::event::{CANCELLATIONS_TOPIC, PIPELINE_EVENTS_TOPIC};
use pipeline_types::event::{job_id_from_payload, PipelineEvent};
use pipeline_types::job::{Job, JobState, JobType, NewJob};
use pipeline_types::ledger::AssetKey;
use pipeline_types::project::{Project, ProjectStatus, Scene};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// External commands, handler-owned (§6).
pub const COMMANDS_TOPIC: &str = "commands";

const COMMANDS_SUBSCRIPTION: &str = "handler:commands";
const JOB_COMPLETED_SUBSCRIPTION: &str = "handler:job-completed";
const JOB_FAILED_SUBSCRIPTION: &str = "handler:job-failed";

const PROJECT_LOCK_TTL: Duration = Duration::from_secs(30);
const POLL_IDLE_BACKOFF: Duration = Duration::from_millis(200);

fn project_lock_key(project_id: Uuid) -> String {
    format!("project:{project_id}")
}

fn frame_label(frame_type: FrameType) -> &'static str {
    match frame_type {
        FrameType::Start => "start",
        FrameType::End => "end",
    }
}

fn frame_asset_key(frame_type: FrameType) -> &'static str {
    match frame_type {
        FrameType::Start => AssetKey::SCENE_START_FRAME,
        FrameType::End => AssetKey::SCENE_END_FRAME,
    }
}

/// Bumps the `#r{n}` retry epoch suffix on a `uniqueKey` so a
/// `RESOLVE_INTERVENTION` retry gets a fresh idempotency key instead of
/// colliding with the `FATAL` row it replaces (SPEC_FULL §B).
fn bump_retry_epoch(unique_key: &str) -> String {
    if let Some(idx) = unique_key.rfind("#r") {
        let (base, suffix) = unique_key.split_at(idx);
        if let Ok(n) = suffix[2..].parse::<u32>() {
            return format!("{base}#r{}", n + 1);
        }
    }
    format!("{unique_key}#r1")
}

/// Merges `patch` onto `payload` if both are JSON objects; otherwise
/// `patch` replaces `payload` wholesale.
fn merge_revised_params(mut payload: serde_json::Value, patch: serde_json::Value) -> serde_json::Value {
    match (payload.as_object_mut(), patch.as_object()) {
        (Some(existing), Some(patch_obj)) => {
            for (k, v) in patch_obj {
                existing.insert(k.clone(), v.clone());
            }
            payload
        }
        _ => patch,
    }
}

pub struct CommandHandler {
    repo: Arc<ProjectRepo>,
    ledger: Arc<LedgerStore>,
    jobs: Arc<JobStore>,
    locks: Arc<LockManager>,
    bus: Arc<dyn EventBus>,
    default_max_retries: i32,
}

impl CommandHandler {
    pub fn new(
        repo: Arc<ProjectRepo>,
        ledger: Arc<LedgerStore>,
        jobs: Arc<JobStore>,
        locks: Arc<LockManager>,
        bus: Arc<dyn EventBus>,
        default_max_retries: i32,
    ) -> Self {
        Self {
            repo,
            ledger,
            jobs,
            locks,
            bus,
            default_max_retries,
        }
    }

    pub async fn handle_command(&self, command: Command) -> Result<(), HandlerError> {
        match command {
            Command::StartPipeline { project_id, .. } => self.start_pipeline(project_id).await,
            Command::ResumePipeline { project_id } => self.resume_pipeline(project_id).await,
            Command::RegenerateScene { project_id, scene_id } => {
                self.regenerate_scene(project_id, scene_id).await
            }
            Command::RegenerateFrame {
                project_id,
                scene_id,
                frame_type,
                prompt_modification,
            } => {
                self.regenerate_frame(project_id, scene_id, frame_type, prompt_modification)
                    .await
            }
            Command::UpdateSceneAsset {
                project_id,
                scene_id,
                asset_key,
                version,
            } => self.update_scene_asset(project_id, scene_id, asset_key, version).await,
            Command::ResolveIntervention {
                project_id,
                job_id,
                action,
                revised_params,
            } => self.resolve_intervention(project_id, job_id, action, revised_params).await,
            Command::StopPipeline { project_id } => self.stop_pipeline(project_id).await,
            Command::RequestFullState { project_id } => self.request_full_state(project_id).await,
        }
    }

    /// `START_PIPELINE`: only takes effect from `draft` (§4.6).
    async fn start_pipeline(&self, project_id: Uuid) -> Result<(), HandlerError> {
        let key = project_lock_key(project_id);
        self.locks
            .with_lock(&key, PROJECT_LOCK_TTL, || async {
                let mut project = self.repo.get_project_full_state(project_id).await?;
                if project.status != ProjectStatus::Draft {
                    return Ok(());
                }
                project.status = ProjectStatus::Running;
                self.repo.update_project(&project).await?;
                self.progress_locked(&project).await
            })
            .await
    }

    /// `RESUME_PIPELINE`: re-evaluates progression from wherever it left
    /// off, re-dispatching the first non-terminal stage.
    async fn resume_pipeline(&self, project_id: Uuid) -> Result<(), HandlerError> {
        let key = project_lock_key(project_id);
        self.locks
            .with_lock(&key, PROJECT_LOCK_TTL, || async {
                let mut project = self.repo.get_project_full_state(project_id).await?;
                if project.status == ProjectStatus::Paused {
                    project.status = ProjectStatus::Running;
                    self.repo.update_project(&project).await?;
                }
                if matches!(project.status, ProjectStatus::Running | ProjectStatus::Pending) {
                    self.progress_locked(&project).await
                } else {
                    Ok(())
                }
            })
            .await
    }

    /// Reacts to a `JOB_COMPLETED`/`JOB_FAILED` delivery: re-evaluates
    /// progression for the job's project. A no-op if the project is not
    /// currently `running`/`pending` (e.g. already `paused` by a
    /// `STOP_PIPELINE` that raced the completion).
    pub async fn advance_project(&self, project_id: Uuid) -> Result<(), HandlerError> {
        let key = project_lock_key(project_id);
        self.locks
            .with_lock(&key, PROJECT_LOCK_TTL, || async {
                let project = self.repo.get_project_full_state(project_id).await?;
                if !matches!(project.status, ProjectStatus::Running | ProjectStatus::Pending) {
                    return Ok(());
                }
                self.progress_locked(&project).await
            })
            .await
    }

    /// §4.6 items 2-4: walk the fixed stage order, dispatch the first
    /// not-started stage's work units, mark the project `error` if a
    /// stage went terminally `FATAL`, or `complete` once every stage has
    /// `COMPLETED`. Never advances past an `InProgress` stage (§7 property
    /// 5) — the handler does not block on completion, it returns after
    /// dispatching (§4.6 item 3).
    async fn progress_locked(&self, project: &Project) -> Result<(), HandlerError> {
        let stages = stage_order(project.metadata.has_audio);
        let jobs = self.jobs.get_project_jobs(project.id).await?;
        let jobs_by_key: HashMap<String, Job> =
            jobs.into_iter().map(|j| (j.unique_key.clone(), j)).collect();

        for stage in stages {
            let units = work_units(stage, project);
            match stage_status(&units, &jobs_by_key) {
                StageStatus::Completed => continue,
                StageStatus::NotStarted => {
                    for unit in units {
                        self.create_and_dispatch(project.id, unit).await?;
                    }
                    return Ok(());
                }
                StageStatus::InProgress => return Ok(()),
                StageStatus::Fatal => {
                    return self.set_project_status(project, ProjectStatus::Error).await;
                }
            }
        }

        self.set_project_status(project, ProjectStatus::Complete).await
    }

    /// `REGENERATE_SCENE`: records the scene in `forceRegenerateSceneIds`
    /// and dispatches a `GENERATE_SCENE_VIDEO` job at a bumped version,
    /// bypassing the stage barrier entirely (SPEC_FULL §B).
    async fn regenerate_scene(&self, project_id: Uuid, scene_id: Uuid) -> Result<(), HandlerError> {
        let key = project_lock_key(project_id);
        self.locks
            .with_lock(&key, PROJECT_LOCK_TTL, || async {
                let mut project = self.repo.get_project_full_state(project_id).await?;
                let scene = project
                    .scenes
                    .iter()
                    .find(|s| s.id == scene_id)
                    .cloned()
                    .ok_or(HandlerError::SceneNotFound(scene_id))?;

                if !project.force_regenerate_scene_ids.contains(&scene_id) {
                    project.force_regenerate_scene_ids.push(scene_id);
                    self.repo.update_project(&project).await?;
                }

                let version = self
                    .ledger
                    .get_next_version_number(Scope::Scene, scene_id, AssetKey::SCENE_VIDEO)
                    .await?;
                let unit = scene_video_unit(&scene, version);
                self.create_and_dispatch(project_id, unit).await?;
                Ok(())
            })
            .await
    }

    /// `REGENERATE_FRAME`: dispatches a standalone `FRAME_RENDER` job,
    /// distinct from the stage-fan-out `GENERATE_SCENE_FRAMES` jobs (§4.6
    /// uniqueKey convention).
    async fn regenerate_frame(
        &self,
        project_id: Uuid,
        scene_id: Uuid,
        frame_type: FrameType,
        prompt_modification: Option<String>,
    ) -> Result<(), HandlerError> {
        let key = project_lock_key(project_id);
        self.locks
            .with_lock(&key, PROJECT_LOCK_TTL, || async {
                self.repo.get_scene(project_id, scene_id).await?;

                let asset_key = frame_asset_key(frame_type);
                let label = frame_label(frame_type);
                let version = self
                    .ledger
                    .get_next_version_number(Scope::Scene, scene_id, asset_key)
                    .await?;
                let unique_key = format!("frame_render:{project_id}:{scene_id}:{label}:v{version}");
                let payload = serde_json::json!({
                    "sceneId": scene_id,
                    "frameType": label,
                    "promptModification": prompt_modification,
                });

                let new_job = NewJob {
                    project_id,
                    job_type: JobType::FrameRender,
                    unique_key,
                    payload,
                    max_retries: self.default_max_retries,
                    asset_key: Some(asset_key.to_string()),
                };
                let created = self.jobs.create_job(new_job).await?;
                self.jobs.dispatch(created.id).await?;
                Ok(())
            })
            .await
    }

    /// `UPDATE_SCENE_ASSET`: validates `1 <= version <= head` before
    /// moving `best` — out-of-range requests are rejected, not clamped
    /// (SPEC_FULL §B).
    async fn update_scene_asset(
        &self,
        project_id: Uuid,
        scene_id: Uuid,
        asset_key: String,
        version: u32,
    ) -> Result<(), HandlerError> {
        self.repo.get_scene(project_id, scene_id).await?;
        let head = self
            .ledger
            .get_next_version_number(Scope::Scene, scene_id, &asset_key)
            .await?
            .saturating_sub(1);
        if version == 0 || version > head {
            return Err(HandlerError::Validation(format!(
                "version {version} out of range 1..={head} for scene {scene_id} asset {asset_key}"
            )));
        }
        self.ledger
            .set_best_version(Scope::Scene, scene_id, &asset_key, version)
            .await?;

        let updated = self.repo.get_scene(project_id, scene_id).await?;
        self.publish_scene_update(&updated).await
    }

    /// `RESOLVE_INTERVENTION`: `retry` clones the `FATAL` job under a
    /// bumped idempotency epoch; `cancel` transitions it to `CANCELLED`
    /// and, if it was blocking the pipeline, marks the project `error`
    /// (SPEC_FULL §B).
    async fn resolve_intervention(
        &self,
        project_id: Uuid,
        job_id: Uuid,
        action: InterventionAction,
        revised_params: Option<serde_json::Value>,
    ) -> Result<(), HandlerError> {
        let key = project_lock_key(project_id);
        self.locks
            .with_lock(&key, PROJECT_LOCK_TTL, || async {
                let job = self.jobs.get_job(job_id).await?;
                if job.project_id != project_id {
                    return Err(HandlerError::JobNotFound(job_id));
                }
                if job.state != JobState::Fatal {
                    return Err(HandlerError::Validation(format!(
                        "job {job_id} is not awaiting intervention (state {:?})",
                        job.state
                    )));
                }
                match action {
                    InterventionAction::Retry => {
                        let payload = match revised_params {
                            Some(patch) => merge_revised_params(job.payload.clone(), patch),
                            None => job.payload.clone(),
                        };
                        let new_job = NewJob {
                            project_id,
                            job_type: job.job_type,
                            unique_key: bump_retry_epoch(&job.unique_key),
                            payload,
                            max_retries: job.max_retries,
                            asset_key: job.asset_key.clone(),
                        };
                        let created = self.jobs.create_job(new_job).await?;
                        self.jobs.dispatch(created.id).await?;
                    }
                    InterventionAction::Cancel => {
                        self.jobs.cancel_job(job_id).await?;
                        let mut project = self.repo.get_project(project_id).await?;
                        if project.status != ProjectStatus::Error {
                            project.status = ProjectStatus::Error;
                            self.repo.update_project(&project).await?;
                        }
                        let full = self.repo.get_project_full_state(project_id).await?;
                        self.publish_full_state(&full).await?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// `STOP_PIPELINE` (§5 "Cancellation"): pauses the project, cancels
    /// every outstanding job, and broadcasts on the cancellations topic so
    /// in-flight workers can abort.
    async fn stop_pipeline(&self, project_id: Uuid) -> Result<(), HandlerError> {
        let key = project_lock_key(project_id);
        self.locks
            .with_lock(&key, PROJECT_LOCK_TTL, || async {
                let mut project = self.repo.get_project(project_id).await?;
                project.status = ProjectStatus::Paused;
                self.repo.update_project(&project).await?;
                self.jobs.cancel_project_jobs(project_id).await?;
                self.publish_cancellation(project_id).await?;
                let full = self.repo.get_project_full_state(project_id).await?;
                self.publish_full_state(&full).await
            })
            .await
    }

    async fn request_full_state(&self, project_id: Uuid) -> Result<(), HandlerError> {
        let project = self.repo.get_project_full_state(project_id).await?;
        self.publish_full_state(&project).await
    }

    async fn create_and_dispatch(&self, project_id: Uuid, unit: WorkUnit) -> Result<Job, HandlerError> {
        let new_job = NewJob {
            project_id,
            job_type: unit.job_type,
            unique_key: unit.unique_key,
            payload: unit.payload,
            max_retries: self.default_max_retries,
            asset_key: unit.asset_key,
        };
        let job = self.jobs.create_job(new_job).await?;
        let job = self.jobs.dispatch(job.id).await?;
        Ok(job)
    }

    async fn set_project_status(&self, project: &Project, status: ProjectStatus) -> Result<(), HandlerError> {
        if project.status == status {
            return Ok(());
        }
        let mut updated = project.clone();
        updated.status = status;
        self.repo.update_project(&updated).await?;
        let full = self.repo.get_project_full_state(project.id).await?;
        self.publish_full_state(&full).await
    }

    /// Clears a completed/fatal `GENERATE_SCENE_VIDEO` job's scene out of
    /// `forceRegenerateSceneIds` so the scene can be regenerated again
    /// later (SPEC_FULL §B).
    async fn clear_force_regenerate(&self, project_id: Uuid, scene_id: Uuid) -> Result<(), HandlerError> {
        let key = project_lock_key(project_id);
        self.locks
            .with_lock(&key, PROJECT_LOCK_TTL, || async {
                let mut project = self.repo.get_project(project_id).await?;
                if let Some(pos) = project.force_regenerate_scene_ids.iter().position(|id| *id == scene_id) {
                    project.force_regenerate_scene_ids.remove(pos);
                    self.repo.update_project(&project).await?;
                }
                Ok(())
            })
            .await
    }

    async fn on_job_terminal(&self, job: &Job) -> Result<(), HandlerError> {
        if job.job_type == JobType::GenerateSceneVideo && job.state.is_terminal() {
            if let Some(scene_id) = job
                .payload
                .get("sceneId")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                self.clear_force_regenerate(job.project_id, scene_id).await?;
            }
        }
        Ok(())
    }

    async fn publish_full_state(&self, project: &Project) -> Result<(), HandlerError> {
        self.bus.ensure_topic(PIPELINE_EVENTS_TOPIC).await?;
        let event = PipelineEvent::FullState { project: project.clone() };
        let mut attributes = HashMap::new();
        attributes.insert("type".to_string(), event.kind().to_string());
        self.bus
            .publish(PIPELINE_EVENTS_TOPIC, attributes, serde_json::to_value(&event)?)
            .await?;
        Ok(())
    }

    async fn publish_scene_update(&self, scene: &Scene) -> Result<(), HandlerError> {
        self.bus.ensure_topic(PIPELINE_EVENTS_TOPIC).await?;
        let event = PipelineEvent::SceneUpdate { scene: scene.clone() };
        let mut attributes = HashMap::new();
        attributes.insert("type".to_string(), event.kind().to_string());
        self.bus
            .publish(PIPELINE_EVENTS_TOPIC, attributes, serde_json::to_value(&event)?)
            .await?;
        Ok(())
    }

    async fn publish_cancellation(&self, project_id: Uuid) -> Result<(), HandlerError> {
        self.bus.ensure_topic(CANCELLATIONS_TOPIC).await?;
        let mut attributes = HashMap::new();
        attributes.insert("type".to_string(), "CANCEL".to_string());
        self.bus
            .publish(CANCELLATIONS_TOPIC, attributes, serde_json::json!({"projectId": project_id}))
            .await?;
        Ok(())
    }

    async fn ensure_subscriptions(&self) -> Result<(), HandlerError> {
        self.bus.ensure_topic(COMMANDS_TOPIC).await?;
        self.bus.ensure_topic(pipeline_jobs::JOB_EVENTS_TOPIC).await?;

        self.bus
            .ensure_subscription(COMMANDS_SUBSCRIPTION, COMMANDS_TOPIC, HashMap::new(), None)
            .await?;

        let mut completed_filter = HashMap::new();
        completed_filter.insert("type".to_string(), "JOB_COMPLETED".to_string());
        self.bus
            .ensure_subscription(
                JOB_COMPLETED_SUBSCRIPTION,
                pipeline_jobs::JOB_EVENTS_TOPIC,
                completed_filter,
                None,
            )
            .await?;

        let mut failed_filter = HashMap::new();
        failed_filter.insert("type".to_string(), "JOB_FAILED".to_string());
        self.bus
            .ensure_subscription(
                JOB_FAILED_SUBSCRIPTION,
                pipeline_jobs::JOB_EVENTS_TOPIC,
                failed_filter,
                None,
            )
            .await?;
        Ok(())
    }

    async fn poll_commands(&self) -> bool {
        let message = match self.bus.poll(COMMANDS_SUBSCRIPTION).await {
            Ok(Some(message)) => message,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "command poll failed");
                return false;
            }
        };

        match serde_json::from_value::<Command>(message.payload.clone()) {
            Ok(command) => {
                if let Err(err) = self.handle_command(command).await {
                    tracing::warn!(error = %err, "command handling failed");
                }
            }
            Err(err) => tracing::warn!(error = %err, "dropping malformed command"),
        }

        if let Err(err) = self.bus.ack(COMMANDS_SUBSCRIPTION, message.seq).await {
            tracing::warn!(error = %err, "failed to ack command");
        }
        true
    }

    async fn poll_job_completed(&self) -> bool {
        let message = match self.bus.poll(JOB_COMPLETED_SUBSCRIPTION).await {
            Ok(Some(message)) => message,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "JOB_COMPLETED poll failed");
                return false;
            }
        };

        if let Some(job_id) = job_id_from_payload(&message.payload) {
            match self.jobs.get_job(job_id).await {
                Ok(job) => {
                    if let Err(err) = self.on_job_terminal(&job).await {
                        tracing::warn!(error = %err, "force-regenerate clear failed");
                    }
                    if let Err(err) = self.advance_project(job.project_id).await {
                        tracing::warn!(error = %err, "advance_project after JOB_COMPLETED failed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "could not load completed job"),
            }
        }

        if let Err(err) = self.bus.ack(JOB_COMPLETED_SUBSCRIPTION, message.seq).await {
            tracing::warn!(error = %err, "failed to ack JOB_COMPLETED");
        }
        true
    }

    async fn poll_job_failed(&self) -> bool {
        let message = match self.bus.poll(JOB_FAILED_SUBSCRIPTION).await {
            Ok(Some(message)) => message,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(error = %err, "JOB_FAILED poll failed");
                return false;
            }
        };

        if let Some(job_id) = job_id_from_payload(&message.payload) {
            match self.jobs.get_job(job_id).await {
                Ok(job) => {
                    if let Err(err) = self.on_job_terminal(&job).await {
                        tracing::warn!(error = %err, "force-regenerate clear failed");
                    }
                    if let Err(err) = self.advance_project(job.project_id).await {
                        tracing::warn!(error = %err, "advance_project after JOB_FAILED failed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "could not load failed job"),
            }
        }

        if let Err(err) = self.bus.ack(JOB_FAILED_SUBSCRIPTION, message.seq).await {
            tracing::warn!(error = %err, "failed to ack JOB_FAILED");
        }
        true
    }

    async fn poll_round(&self) -> bool {
        let mut processed = false;
        processed |= self.poll_commands().await;
        processed |= self.poll_job_completed().await;
        processed |= self.poll_job_failed().await;
        processed
    }

    /// Consume loop: commands plus two job-events subscriptions, since
    /// `EventBus` attribute filters only support AND-of-exact-match, so
    /// `JOB_COMPLETED | JOB_FAILED` needs two subscriptions rather than one
    /// OR-filter (§4.8).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(err) = self.ensure_subscriptions().await {
            tracing::error!(error = %err, "failed to ensure command handler subscriptions");
            return;
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let processed = self.poll_round().await;
            if !processed {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_IDLE_BACKOFF) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_epoch_bumps_from_none() {
        assert_eq!(bump_retry_epoch("video:p:s:v1"), "video:p:s:v1#r1");
    }

    #[test]
    fn retry_epoch_bumps_existing_suffix() {
        assert_eq!(bump_retry_epoch("video:p:s:v1#r1"), "video:p:s:v1#r2");
    }

    #[test]
    fn merge_revised_params_merges_objects() {
        let payload = serde_json::json!({"a": 1, "b": 2});
        let patch = serde_json::json!({"b": 3, "c": 4});
        let merged = merge_revised_params(payload, patch);
        assert_eq!(merged, serde_json::json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn merge_revised_params_replaces_non_objects() {
        let payload = serde_json::json!("scalar");
        let patch = serde_json::json!({"replaced": true});
        let merged = merge_revised_params(payload, patch.clone());
        assert_eq!(merged, patch);
    }
}
