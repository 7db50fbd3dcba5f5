//! The seam to the out-of-scope generative agents (§1, §4.7): prompt
//! composition, model calls, and media stitching all live behind
//! `AgentExecutor`. The worker crate only knows how to call it, classify
//! what comes back, and turn the result into ledger writes and job-state
//! transitions.

use crate::error::AgentError;
use async_trait::async_trait;
use pipeline_types::job::JobType;
use pipeline_types::ledger::{AssetVersionMetadata, AssetVersionType};
use pipeline_types::project::{Character, Location, Scene, SceneStatus};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One asset append an agent wants committed to the ledger, scoped to a
/// specific entity — a job whose payload names several entities (e.g.
/// `GENERATE_CHARACTER_ASSETS` covering every character in a project)
/// produces one `LedgerWrite` per entity rather than a single batched one,
/// since the ledger's write lock (§4.3) is per-entity.
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    pub scope: pipeline_ledger::Scope,
    pub entity_id: Uuid,
    pub asset_key: String,
    pub version_type: AssetVersionType,
    pub data: serde_json::Value,
    pub metadata: AssetVersionMetadata,
    /// Whether this version should become `best` once appended. Per §4.3,
    /// an empty ledger always adopts its first version as `best`
    /// regardless of this flag; it only matters for a ledger that already
    /// has one.
    pub set_best: bool,
}

/// A scene status/continuity-state transition the agent observed as a side
/// effect of its work (e.g. a video render that also updates injuries/dirt
/// continuity for the next scene, SPEC_FULL §B).
#[derive(Debug, Clone)]
pub struct SceneTransition {
    pub scene_id: Uuid,
    pub status: Option<SceneStatus>,
    pub continuity_state: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// A brand-new scene set a storyboard/audio-to-scenes job wants inserted,
/// paired with the project's total duration those scenes must partition
/// (§3) — `ProjectRepo::create_scenes` validates the partition against it
/// before anything is written.
#[derive(Debug, Clone)]
pub struct ScenesCreated {
    pub total_duration: f64,
    pub scenes: Vec<Scene>,
}

/// Everything a successful agent call produced. The worker applies
/// `ledger_writes` under `pipeline-ledger`'s per-entity locks, then
/// `scenes_created`/`characters`/`locations` under the per-project lock
/// (§5 "Ordering guarantees" — these are aggregate structural writes, not
/// append-only, so they don't get to skip the lock the way ledger appends
/// do), then `scene_transitions` via the repository, before marking the
/// job `COMPLETED` (§4.7 item 4).
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub ledger_writes: Vec<LedgerWrite>,
    pub scene_transitions: Vec<SceneTransition>,
    /// Populated by `GENERATE_STORYBOARD`/`PROCESS_AUDIO_TO_SCENES`: the
    /// scene set that seeds `work_units`' per-scene fan-out stages.
    pub scenes_created: Option<ScenesCreated>,
    /// Populated by `GENERATE_CHARACTER_ASSETS`. Upserted by id, so this
    /// also carries continuity-state updates to existing characters.
    pub characters: Vec<Character>,
    /// Populated by `GENERATE_LOCATION_ASSETS`. Upserted by id, same as
    /// `characters`.
    pub locations: Vec<Location>,
}

/// One method wide: the rest of the taxonomy (model choice, prompt
/// construction, media stitching) is out of scope (§1) and lives entirely
/// behind this trait in a real deployment.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(
        &self,
        job_type: JobType,
        payload: &serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError>;
}

/// Deserialized shape a `MockAgentExecutor` (or a fixture-driven real
/// executor) reads out of a job payload's `__mock_outcome` field in tests,
/// so test fixtures can describe an outcome as plain JSON instead of
/// constructing `AgentOutcome` by hand.
#[derive(Debug, Deserialize)]
struct MockDirective {
    #[serde(default)]
    fail: Option<MockFailure>,
    #[serde(default)]
    scenes_created: Option<ScenesCreatedFixture>,
    #[serde(default)]
    characters: Vec<Character>,
    #[serde(default)]
    locations: Vec<Location>,
}

#[derive(Debug, Deserialize)]
struct ScenesCreatedFixture {
    total_duration: f64,
    scenes: Vec<Scene>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum MockFailure {
    Transient,
    RateLimit,
    Safety,
    Validation,
}

/// Deterministic stand-in for the real generative agents, used by worker
/// unit tests and local demos. Reads an optional `__mock_outcome.fail`
/// directive out of the payload to exercise the error-classification
/// paths; otherwise returns an empty, successful outcome.
#[derive(Debug, Default)]
pub struct MockAgentExecutor;

#[async_trait]
impl AgentExecutor for MockAgentExecutor {
    async fn run(
        &self,
        _job_type: JobType,
        payload: &serde_json::Value,
        _cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        if let Some(directive) = payload.get("__mock_outcome") {
            if let Ok(directive) = serde_json::from_value::<MockDirective>(directive.clone()) {
                if let Some(fail) = directive.fail {
                    return Err(match fail {
                        MockFailure::Transient => AgentError::Transient("mock transient".into()),
                        MockFailure::RateLimit => AgentError::RateLimit("mock 429".into()),
                        MockFailure::Safety => AgentError::Safety("mock content filter".into()),
                        MockFailure::Validation => AgentError::Validation("mock schema error".into()),
                    });
                }
                return Ok(AgentOutcome {
                    scenes_created: directive.scenes_created.map(|f| ScenesCreated {
                        total_duration: f.total_duration,
                        scenes: f.scenes,
                    }),
                    characters: directive.characters,
                    locations: directive.locations,
                    ..AgentOutcome::default()
                });
            }
        }
        Ok(AgentOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_empty_outcome_with_no_directive() {
        let agent = MockAgentExecutor;
        let outcome = agent
            .run(JobType::ExpandCreativePrompt, &serde_json::json!({}), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.ledger_writes.is_empty());
        assert!(outcome.scene_transitions.is_empty());
    }

    #[tokio::test]
    async fn honors_mock_fail_directive() {
        let agent = MockAgentExecutor;
        let payload = serde_json::json!({"__mock_outcome": {"fail": {"kind": "rate_limit"}}});
        let err = agent
            .run(JobType::GenerateStoryboard, &payload, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RateLimit(_)));
    }

    #[tokio::test]
    async fn honors_mock_scenes_created_directive() {
        let agent = MockAgentExecutor;
        let scene = serde_json::json!({
            "id": Uuid::new_v4(),
            "project_id": Uuid::new_v4(),
            "index": 0,
            "start_time": 0.0,
            "end_time": 4.0,
            "duration_secs": 4,
            "description": "a scene",
            "shot_type": null,
            "camera_movement": null,
            "lighting": null,
            "mood": null,
            "character_ids": [],
            "location_id": null,
            "status": "pending",
            "continuity_state": null,
            "assets": {},
            "error_message": null,
        });
        let payload = serde_json::json!({
            "__mock_outcome": {
                "scenes_created": {"total_duration": 4.0, "scenes": [scene]}
            }
        });
        let outcome = agent
            .run(JobType::GenerateStoryboard, &payload, CancellationToken::new())
            .await
            .unwrap();
        let created = outcome.scenes_created.expect("scenes_created populated");
        assert_eq!(created.total_duration, 4.0);
        assert_eq!(created.scenes.len(), 1);
    }
}
