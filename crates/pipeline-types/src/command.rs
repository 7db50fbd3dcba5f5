//! Commands received from the UI on the commands topic (§6).
//!
//! Modeled as a tagged enum so unknown command types are rejected at the
//! deserialization boundary rather than silently ignored (Design Note, §9).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    Retry,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "START_PIPELINE")]
    StartPipeline { project_id: Uuid, command_id: Uuid },
    #[serde(rename = "RESUME_PIPELINE")]
    ResumePipeline { project_id: Uuid },
    #[serde(rename = "REGENERATE_SCENE")]
    RegenerateScene { project_id: Uuid, scene_id: Uuid },
    #[serde(rename = "REGENERATE_FRAME")]
    RegenerateFrame {
        project_id: Uuid,
        scene_id: Uuid,
        frame_type: FrameType,
        prompt_modification: Option<String>,
    },
    #[serde(rename = "UPDATE_SCENE_ASSET")]
    UpdateSceneAsset {
        project_id: Uuid,
        scene_id: Uuid,
        asset_key: String,
        version: u32,
    },
    #[serde(rename = "RESOLVE_INTERVENTION")]
    ResolveIntervention {
        project_id: Uuid,
        job_id: Uuid,
        action: InterventionAction,
        revised_params: Option<serde_json::Value>,
    },
    #[serde(rename = "STOP_PIPELINE")]
    StopPipeline { project_id: Uuid },
    #[serde(rename = "REQUEST_FULL_STATE")]
    RequestFullState { project_id: Uuid },
}

impl Command {
    pub fn project_id(&self) -> Uuid {
        match self {
            Command::StartPipeline { project_id, .. }
            | Command::ResumePipeline { project_id }
            | Command::RegenerateScene { project_id, .. }
            | Command::RegenerateFrame { project_id, .. }
            | Command::UpdateSceneAsset { project_id, .. }
            | Command::ResolveIntervention { project_id, .. }
            | Command::StopPipeline { project_id }
            | Command::RequestFullState { project_id } => *project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_type_is_rejected() {
        let raw = serde_json::json!({"type": "DELETE_EVERYTHING", "project_id": Uuid::nil()});
        let result: Result<Command, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }

    #[test]
    fn start_pipeline_round_trips() {
        let cmd = Command::StartPipeline {
            project_id: Uuid::new_v4(),
            command_id: Uuid::new_v4(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd.project_id(), back.project_id());
    }
}
