//! Project aggregate: project, scene, character, location (§3).

use crate::ledger::AssetLedger;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Pending,
    Running,
    Paused,
    Complete,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub title: String,
    pub initial_prompt: String,
    pub enhanced_prompt: Option<String>,
    pub has_audio: bool,
    pub audio_uri: Option<String>,
    pub total_duration: f64,
}

/// Top-level aggregate. Mutated only by the command handler and by
/// completion reactions; never destroyed by the core (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub status: ProjectStatus,
    pub metadata: ProjectMetadata,
    pub generation_rules: Vec<String>,
    pub generation_rules_history: Vec<Vec<String>>,
    pub force_regenerate_scene_ids: Vec<Uuid>,
    pub assets: AssetLedger,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Populated only by `getProjectFullState`; empty on the lightweight
    /// `getProject` read (§4.4).
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub locations: Vec<Location>,
}

impl Project {
    /// Replace `generation_rules`, pushing the previous value onto history
    /// first. Never truncates history (SPEC_FULL §B).
    pub fn set_generation_rules(&mut self, rules: Vec<String>) {
        if !self.generation_rules.is_empty() || !self.generation_rules_history.is_empty() {
            self.generation_rules_history
                .push(std::mem::take(&mut self.generation_rules));
        }
        self.generation_rules = rules;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Pending,
    Generating,
    Complete,
    Error,
}

/// Allowed scene durations, in seconds (§3).
pub const ALLOWED_SCENE_DURATIONS: [i64; 3] = [4, 6, 8];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: Uuid,
    pub project_id: Uuid,
    pub index: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub duration_secs: i64,
    pub description: String,
    pub shot_type: Option<String>,
    pub camera_movement: Option<String>,
    pub lighting: Option<String>,
    pub mood: Option<String>,
    pub character_ids: Vec<Uuid>,
    pub location_id: Option<Uuid>,
    pub status: SceneStatus,
    /// Opaque state blob (injuries, dirt, weather, ...) carried from the
    /// previous scene and handed to generative agents verbatim; the core
    /// never interprets it (SPEC_FULL §B).
    #[serde(default)]
    pub continuity_state: serde_json::Value,
    pub assets: AssetLedger,
    pub error_message: Option<String>,
}

impl Scene {
    /// `endTime = startTime + duration` (§3 invariant).
    pub fn recompute_end_time(&mut self) {
        self.end_time = self.start_time + self.duration_secs as f64;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub state: serde_json::Value,
    pub assets: AssetLedger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub state: serde_json::Value,
    pub assets: AssetLedger,
}

/// Validate the scene time-partition invariant: scenes, sorted by `index`,
/// must partition `[0, total_duration)` with no gaps or overlaps.
pub fn validate_scene_partition(scenes: &[Scene], total_duration: f64) -> Result<(), String> {
    let mut sorted: Vec<&Scene> = scenes.iter().collect();
    sorted.sort_by_key(|s| s.index);
    let mut cursor = 0.0_f64;
    for (i, scene) in sorted.iter().enumerate() {
        if scene.index as usize != i {
            return Err(format!(
                "scene {} has index {} but occupies position {}",
                scene.id, scene.index, i
            ));
        }
        if !ALLOWED_SCENE_DURATIONS.contains(&scene.duration_secs) {
            return Err(format!(
                "scene {} has disallowed duration {}",
                scene.id, scene.duration_secs
            ));
        }
        if (scene.start_time - cursor).abs() > f64::EPSILON {
            return Err(format!(
                "scene {} starts at {} but previous scene ends at {}",
                scene.id, scene.start_time, cursor
            ));
        }
        let expected_end = scene.start_time + scene.duration_secs as f64;
        if (scene.end_time - expected_end).abs() > f64::EPSILON {
            return Err(format!(
                "scene {} endTime {} does not match startTime + duration ({})",
                scene.id, scene.end_time, expected_end
            ));
        }
        cursor = scene.end_time;
    }
    if (cursor - total_duration).abs() > f64::EPSILON {
        return Err(format!(
            "scenes cover [0, {}) but project totalDuration is {}",
            cursor, total_duration
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(index: u32, start: f64, dur: i64) -> Scene {
        Scene {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            index,
            start_time: start,
            end_time: start + dur as f64,
            duration_secs: dur,
            description: String::new(),
            shot_type: None,
            camera_movement: None,
            lighting: None,
            mood: None,
            character_ids: vec![],
            location_id: None,
            status: SceneStatus::Pending,
            continuity_state: serde_json::Value::Null,
            assets: Default::default(),
            error_message: None,
        }
    }

    #[test]
    fn partition_validates_contiguous_scenes() {
        let scenes = vec![scene(0, 0.0, 4), scene(1, 4.0, 6)];
        assert!(validate_scene_partition(&scenes, 10.0).is_ok());
    }

    #[test]
    fn partition_rejects_gap() {
        let scenes = vec![scene(0, 0.0, 4), scene(1, 5.0, 6)];
        assert!(validate_scene_partition(&scenes, 11.0).is_err());
    }

    #[test]
    fn partition_rejects_bad_duration() {
        let scenes = vec![scene(0, 0.0, 5)];
        assert!(validate_scene_partition(&scenes, 5.0).is_err());
    }

    #[test]
    fn generation_rules_history_accumulates() {
        let mut project = Project {
            id: Uuid::new_v4(),
            status: ProjectStatus::Draft,
            metadata: ProjectMetadata::default(),
            generation_rules: vec!["a".into()],
            generation_rules_history: vec![],
            force_regenerate_scene_ids: vec![],
            assets: Default::default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            scenes: vec![],
            characters: vec![],
            locations: vec![],
        };
        project.set_generation_rules(vec!["b".into()]);
        project.set_generation_rules(vec!["c".into()]);
        assert_eq!(project.generation_rules, vec!["c".to_string()]);
        assert_eq!(
            project.generation_rules_history,
            vec![vec!["a".to_string()], vec!["b".to_string()]]
        );
    }
}
