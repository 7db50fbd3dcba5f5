//! Events published by the core, consumed by the UI and by workers (§6, §4.8).

use crate::project::Project;
use crate::project::Scene;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fan-out topic for `PipelineEvent`s to UIs (§4.8, §6). Shared by the
/// command handler and the worker so both publish to the same name without
/// either owning it.
pub const PIPELINE_EVENTS_TOPIC: &str = "pipeline-events";
/// Per-project cancellation broadcasts (§4.8, §5), consumed by every
/// worker's ephemeral cancellations subscription.
pub const CANCELLATIONS_TOPIC: &str = "cancellations";

/// Job-events topic payloads. Workers subscribe filtered to `JobDispatched`;
/// the command handler subscribes filtered to `JobCompleted | JobFailed`
/// (§4.6, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    #[serde(rename = "JOB_DISPATCHED")]
    JobDispatched { job_id: Uuid, project_id: Uuid },
    #[serde(rename = "JOB_STARTED")]
    JobStarted { job_id: Uuid },
    #[serde(rename = "JOB_COMPLETED")]
    JobCompleted { job_id: Uuid, project_id: Uuid },
    #[serde(rename = "JOB_FAILED")]
    JobFailed { job_id: Uuid, error: String },
}

impl JobEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::JobDispatched { .. } => "JOB_DISPATCHED",
            JobEvent::JobStarted { .. } => "JOB_STARTED",
            JobEvent::JobCompleted { .. } => "JOB_COMPLETED",
            JobEvent::JobFailed { .. } => "JOB_FAILED",
        }
    }
}

/// Reads the `jobId` field out of a raw job-events message payload.
/// Shared by `pipeline-handler` (filtering `JOB_COMPLETED`/`JOB_FAILED`) and
/// `pipeline-worker` (filtering `JOB_DISPATCHED`) so both parse the same
/// wire shape rather than keeping their own copies in sync.
pub fn job_id_from_payload(payload: &serde_json::Value) -> Option<Uuid> {
    payload
        .get("jobId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Log level carried by `LOG` pipeline events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Pipeline-events topic payloads, fanned out to UIs (§4.8, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    #[serde(rename = "FULL_STATE")]
    FullState { project: Project },
    #[serde(rename = "SCENE_UPDATE")]
    SceneUpdate { scene: Scene },
    #[serde(rename = "SCENE_PROGRESS")]
    SceneProgress {
        scene_id: Uuid,
        progress: Option<f32>,
    },
    #[serde(rename = "LOG")]
    Log {
        level: LogLevel,
        message: String,
        context: serde_json::Value,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::FullState { .. } => "FULL_STATE",
            PipelineEvent::SceneUpdate { .. } => "SCENE_UPDATE",
            PipelineEvent::SceneProgress { .. } => "SCENE_PROGRESS",
            PipelineEvent::Log { .. } => "LOG",
        }
    }
}
