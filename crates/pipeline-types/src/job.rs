//! Job record types (§3, §4.5).

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    ExpandCreativePrompt,
    GenerateStoryboard,
    ProcessAudioToScenes,
    EnhanceStoryboard,
    SemanticAnalysis,
    GenerateCharacterAssets,
    GenerateLocationAssets,
    GenerateSceneFrames,
    GenerateSceneVideo,
    RenderVideo,
    FrameRender,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Dispatched,
    Running,
    Completed,
    Failed,
    Fatal,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Fatal | JobState::Cancelled)
    }
}

/// Durable unit of work (§3). Mirrors the `jobs` table row exactly so
/// `pipeline-jobs` can map it 1:1 with `sqlx::FromRow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempt: i32,
    pub max_retries: i32,
    pub unique_key: String,
    pub asset_key: Option<String>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub claimed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    pub owner_id: Option<String>,
}

/// Parameters for `createJob` (§4.5).
#[derive(Debug, Clone)]
pub struct NewJob {
    pub project_id: Uuid,
    pub job_type: JobType,
    pub unique_key: String,
    pub payload: serde_json::Value,
    pub max_retries: i32,
    pub asset_key: Option<String>,
}
