use crate::error::RepoError;
use pipeline_db::DbPool;
use pipeline_ledger::{LedgerStore, Scope};
use pipeline_types::project::{
    Character, Location, Project, ProjectMetadata, ProjectStatus, Scene, SceneStatus,
    validate_scene_partition,
};
use std::sync::Arc;
use uuid::Uuid;

/// Project Repository (§4.4): the only crate allowed to issue SQL against
/// `projects`/`scenes`/`characters`/`locations`. Every write that touches
/// the scene set re-validates the time-partition invariant before it
/// commits, because that invariant spans multiple rows and cannot be
/// enforced by a single-row constraint.
pub struct ProjectRepo {
    pool: Arc<DbPool>,
    ledger: Arc<LedgerStore>,
}

impl ProjectRepo {
    pub fn new(pool: Arc<DbPool>, ledger: Arc<LedgerStore>) -> Self {
        Self { pool, ledger }
    }

    async fn load_assets(
        &self,
        scope: Scope,
        entity_id: Uuid,
        asset_keys: &[&str],
    ) -> Result<pipeline_types::ledger::AssetLedger, RepoError> {
        let mut assets = pipeline_types::ledger::AssetLedger::new();
        for key in asset_keys {
            let next = self.ledger.get_next_version_number(scope, entity_id, key).await?;
            if next == 1 {
                continue;
            }
            let best = self.ledger.get_best_version(scope, entity_id, key).await?;
            let mut entry = pipeline_types::ledger::AssetLedgerEntry {
                head: next - 1,
                best: best.as_ref().map(|v| v.version).unwrap_or(0),
                versions: Vec::new(),
            };
            if let Some(version) = best {
                entry.versions.push(version);
            }
            assets.insert(key.to_string(), entry);
        }
        Ok(assets)
    }

    /// Lightweight read: project row only, `scenes`/`characters`/`locations`
    /// left empty (§4.4).
    pub async fn get_project(&self, id: Uuid) -> Result<Project, RepoError> {
        let row: Option<ProjectRow> = self
            .pool
            .query("repo::get_project", move |mut conn| async move {
                sqlx::query_as(PROJECT_SELECT)
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        let row = row.ok_or(RepoError::ProjectNotFound(id))?;
        let assets = self
            .load_assets(Scope::Project, id, &[
                pipeline_types::ledger::AssetKey::STORYBOARD,
                pipeline_types::ledger::AssetKey::AUDIO_ANALYSIS,
            ])
            .await?;
        Ok(row.into_project(assets))
    }

    /// Full aggregate read: project plus every scene/character/location,
    /// each with its best-version assets attached.
    pub async fn get_project_full_state(&self, id: Uuid) -> Result<Project, RepoError> {
        let mut project = self.get_project(id).await?;

        let scene_rows: Vec<SceneRow> = self
            .pool
            .query("repo::get_project_scenes", move |mut conn| async move {
                sqlx::query_as(&format!("{SCENE_SELECT} WHERE project_id = $1 ORDER BY index"))
                    .bind(id)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        let mut scenes = Vec::with_capacity(scene_rows.len());
        for row in scene_rows {
            let assets = self
                .load_assets(Scope::Scene, row.id, &[
                    pipeline_types::ledger::AssetKey::SCENE_START_FRAME,
                    pipeline_types::ledger::AssetKey::SCENE_END_FRAME,
                    pipeline_types::ledger::AssetKey::SCENE_VIDEO,
                    pipeline_types::ledger::AssetKey::SCENE_PROMPT,
                ])
                .await?;
            scenes.push(row.into_scene(assets));
        }

        let char_rows: Vec<CharacterRow> = self
            .pool
            .query("repo::get_project_characters", move |mut conn| async move {
                sqlx::query_as(&format!("{CHARACTER_SELECT} WHERE project_id = $1"))
                    .bind(id)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        let mut characters = Vec::with_capacity(char_rows.len());
        for row in char_rows {
            let assets = self
                .load_assets(Scope::Character, row.id, &[pipeline_types::ledger::AssetKey::CHARACTER_IMAGE])
                .await?;
            characters.push(row.into_character(assets));
        }

        let location_rows: Vec<LocationRow> = self
            .pool
            .query("repo::get_project_locations", move |mut conn| async move {
                sqlx::query_as(&format!("{LOCATION_SELECT} WHERE project_id = $1"))
                    .bind(id)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        let mut locations = Vec::with_capacity(location_rows.len());
        for row in location_rows {
            let assets = Default::default();
            locations.push(row.into_location(assets));
        }

        project.scenes = scenes;
        project.characters = characters;
        project.locations = locations;
        Ok(project)
    }

    pub async fn get_scene(&self, project_id: Uuid, scene_id: Uuid) -> Result<Scene, RepoError> {
        let row: Option<SceneRow> = self
            .pool
            .query("repo::get_scene", move |mut conn| async move {
                sqlx::query_as(&format!("{SCENE_SELECT} WHERE project_id = $1 AND id = $2"))
                    .bind(project_id)
                    .bind(scene_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        let row = row.ok_or(RepoError::SceneNotFound(scene_id))?;
        let assets = self
            .load_assets(Scope::Scene, row.id, &[
                pipeline_types::ledger::AssetKey::SCENE_START_FRAME,
                pipeline_types::ledger::AssetKey::SCENE_END_FRAME,
                pipeline_types::ledger::AssetKey::SCENE_VIDEO,
                pipeline_types::ledger::AssetKey::SCENE_PROMPT,
            ])
            .await?;
        Ok(row.into_scene(assets))
    }

    pub async fn get_characters_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Character>, RepoError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let ids = ids.to_vec();
        let rows: Vec<CharacterRow> = self
            .pool
            .query("repo::get_characters_by_ids", move |mut conn| async move {
                sqlx::query_as(&format!("{CHARACTER_SELECT} WHERE id = ANY($1)"))
                    .bind(&ids)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let assets = self
                .load_assets(Scope::Character, row.id, &[pipeline_types::ledger::AssetKey::CHARACTER_IMAGE])
                .await?;
            out.push(row.into_character(assets));
        }
        Ok(out)
    }

    pub async fn get_locations_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Location>, RepoError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let ids = ids.to_vec();
        let rows: Vec<LocationRow> = self
            .pool
            .query("repo::get_locations_by_ids", move |mut conn| async move {
                sqlx::query_as(&format!("{LOCATION_SELECT} WHERE id = ANY($1)"))
                    .bind(&ids)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(rows.into_iter().map(|r| r.into_location(Default::default())).collect())
    }

    /// Persists the mutable columns of a project row. `assets` is never
    /// written here — it lives in `pipeline-ledger` and is read back
    /// separately.
    pub async fn update_project(&self, project: &Project) -> Result<(), RepoError> {
        let id = project.id;
        let status = status_str(project.status).to_string();
        let metadata = serde_json::to_value(&project.metadata)?;
        let generation_rules = serde_json::to_value(&project.generation_rules)?;
        let generation_rules_history = serde_json::to_value(&project.generation_rules_history)?;
        let force_regenerate_scene_ids = serde_json::to_value(&project.force_regenerate_scene_ids)?;

        self.pool
            .query("repo::update_project", move |mut conn| async move {
                sqlx::query(
                    r#"
                    UPDATE projects SET
                        status = $2,
                        metadata = $3,
                        generation_rules = $4,
                        generation_rules_history = $5,
                        force_regenerate_scene_ids = $6,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&status)
                .bind(&metadata)
                .bind(&generation_rules)
                .bind(&generation_rules_history)
                .bind(&force_regenerate_scene_ids)
                .execute(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    /// Creates a fresh project row in `draft` status.
    pub async fn create_project(&self, metadata: ProjectMetadata) -> Result<Project, RepoError> {
        let id = Uuid::new_v4();
        let metadata_json = serde_json::to_value(&metadata)?;

        self.pool
            .query("repo::create_project", move |mut conn| async move {
                sqlx::query(
                    r#"
                    INSERT INTO projects (id, status, metadata, generation_rules, generation_rules_history, force_regenerate_scene_ids)
                    VALUES ($1, 'draft', $2, '[]', '[]', '[]')
                    "#,
                )
                .bind(id)
                .bind(&metadata_json)
                .execute(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        self.get_project(id).await
    }

    /// Inserts a brand-new scene set for a project, after validating the
    /// time-partition invariant against `total_duration`.
    pub async fn create_scenes(
        &self,
        total_duration: f64,
        scenes: Vec<Scene>,
    ) -> Result<Vec<Scene>, RepoError> {
        validate_scene_partition(&scenes, total_duration).map_err(RepoError::InvalidScenePartition)?;

        for scene in &scenes {
            self.insert_scene(scene).await?;
        }
        Ok(scenes)
    }

    /// Replaces the mutable columns of an existing scene set, re-validating
    /// the partition invariant across the full set first (§3, §4.4).
    pub async fn update_scenes(&self, total_duration: f64, scenes: &[Scene]) -> Result<(), RepoError> {
        validate_scene_partition(scenes, total_duration).map_err(RepoError::InvalidScenePartition)?;
        for scene in scenes {
            self.write_scene(scene).await?;
        }
        Ok(())
    }

    /// Writes back a single scene's mutable status/continuity fields
    /// without re-validating the time-partition invariant — unlike
    /// `update_scenes`, this never touches `start_time`/`end_time`/
    /// `duration_secs`, so there is nothing for that invariant to say.
    /// Used by the worker to record a scene transition observed as the
    /// side effect of a completed job, where reloading and revalidating
    /// every sibling scene would be unnecessary round trips.
    pub async fn update_scene_status(&self, scene: &Scene) -> Result<(), RepoError> {
        self.write_scene(scene).await
    }

    async fn insert_scene(&self, scene: &Scene) -> Result<(), RepoError> {
        let id = scene.id;
        let project_id = scene.project_id;
        let index = scene.index as i32;
        let start_time = scene.start_time;
        let end_time = scene.end_time;
        let duration_secs = scene.duration_secs;
        let description = scene.description.clone();
        let shot_type = scene.shot_type.clone();
        let camera_movement = scene.camera_movement.clone();
        let lighting = scene.lighting.clone();
        let mood = scene.mood.clone();
        let character_ids = serde_json::to_value(&scene.character_ids)?;
        let location_id = scene.location_id;
        let status = scene_status_str(scene.status).to_string();
        let continuity_state = scene.continuity_state.clone();
        let error_message = scene.error_message.clone();

        self.pool
            .query("repo::insert_scene", move |mut conn| async move {
                sqlx::query(
                    r#"
                    INSERT INTO scenes (
                        id, project_id, index, start_time, end_time, duration_secs,
                        description, shot_type, camera_movement, lighting, mood,
                        character_ids, location_id, status, continuity_state, error_message
                    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
                    "#,
                )
                .bind(id)
                .bind(project_id)
                .bind(index)
                .bind(start_time)
                .bind(end_time)
                .bind(duration_secs)
                .bind(&description)
                .bind(&shot_type)
                .bind(&camera_movement)
                .bind(&lighting)
                .bind(&mood)
                .bind(&character_ids)
                .bind(location_id)
                .bind(&status)
                .bind(&continuity_state)
                .bind(&error_message)
                .execute(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    async fn write_scene(&self, scene: &Scene) -> Result<(), RepoError> {
        let id = scene.id;
        let start_time = scene.start_time;
        let end_time = scene.end_time;
        let duration_secs = scene.duration_secs;
        let description = scene.description.clone();
        let shot_type = scene.shot_type.clone();
        let camera_movement = scene.camera_movement.clone();
        let lighting = scene.lighting.clone();
        let mood = scene.mood.clone();
        let character_ids = serde_json::to_value(&scene.character_ids)?;
        let location_id = scene.location_id;
        let status = scene_status_str(scene.status).to_string();
        let continuity_state = scene.continuity_state.clone();
        let error_message = scene.error_message.clone();

        self.pool
            .query("repo::write_scene", move |mut conn| async move {
                sqlx::query(
                    r#"
                    UPDATE scenes SET
                        start_time = $2, end_time = $3, duration_secs = $4,
                        description = $5, shot_type = $6, camera_movement = $7,
                        lighting = $8, mood = $9, character_ids = $10,
                        location_id = $11, status = $12, continuity_state = $13,
                        error_message = $14
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(start_time)
                .bind(end_time)
                .bind(duration_secs)
                .bind(&description)
                .bind(&shot_type)
                .bind(&camera_movement)
                .bind(&lighting)
                .bind(&mood)
                .bind(&character_ids)
                .bind(location_id)
                .bind(&status)
                .bind(&continuity_state)
                .bind(&error_message)
                .execute(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    pub async fn update_characters(&self, characters: &[Character]) -> Result<(), RepoError> {
        for character in characters {
            let id = character.id;
            let project_id = character.project_id;
            let name = character.name.clone();
            let state = character.state.clone();
            self.pool
                .query("repo::update_characters", move |mut conn| async move {
                    sqlx::query(
                        r#"
                        INSERT INTO characters (id, project_id, name, state)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, state = EXCLUDED.state
                        "#,
                    )
                    .bind(id)
                    .bind(project_id)
                    .bind(&name)
                    .bind(&state)
                    .execute(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
                })
                .await?;
        }
        Ok(())
    }

    pub async fn update_locations(&self, locations: &[Location]) -> Result<(), RepoError> {
        for location in locations {
            let id = location.id;
            let project_id = location.project_id;
            let name = location.name.clone();
            let state = location.state.clone();
            self.pool
                .query("repo::update_locations", move |mut conn| async move {
                    sqlx::query(
                        r#"
                        INSERT INTO locations (id, project_id, name, state)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, state = EXCLUDED.state
                        "#,
                    )
                    .bind(id)
                    .bind(project_id)
                    .bind(&name)
                    .bind(&state)
                    .execute(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
                })
                .await?;
        }
        Ok(())
    }
}

fn status_str(status: ProjectStatus) -> &'static str {
    match status {
        ProjectStatus::Draft => "draft",
        ProjectStatus::Pending => "pending",
        ProjectStatus::Running => "running",
        ProjectStatus::Paused => "paused",
        ProjectStatus::Complete => "complete",
        ProjectStatus::Error => "error",
    }
}

fn status_from_str(value: &str) -> ProjectStatus {
    match value {
        "pending" => ProjectStatus::Pending,
        "running" => ProjectStatus::Running,
        "paused" => ProjectStatus::Paused,
        "complete" => ProjectStatus::Complete,
        "error" => ProjectStatus::Error,
        _ => ProjectStatus::Draft,
    }
}

fn scene_status_str(status: SceneStatus) -> &'static str {
    match status {
        SceneStatus::Pending => "pending",
        SceneStatus::Generating => "generating",
        SceneStatus::Complete => "complete",
        SceneStatus::Error => "error",
    }
}

fn scene_status_from_str(value: &str) -> SceneStatus {
    match value {
        "generating" => SceneStatus::Generating,
        "complete" => SceneStatus::Complete,
        "error" => SceneStatus::Error,
        _ => SceneStatus::Pending,
    }
}

const PROJECT_SELECT: &str = "SELECT id, status, metadata, generation_rules, generation_rules_history, force_regenerate_scene_ids, created_at, updated_at FROM projects WHERE id = $1";

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    status: String,
    metadata: serde_json::Value,
    generation_rules: serde_json::Value,
    generation_rules_history: serde_json::Value,
    force_regenerate_scene_ids: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl ProjectRow {
    fn into_project(self, assets: pipeline_types::ledger::AssetLedger) -> Project {
        Project {
            id: self.id,
            status: status_from_str(&self.status),
            metadata: serde_json::from_value(self.metadata).unwrap_or_default(),
            generation_rules: serde_json::from_value(self.generation_rules).unwrap_or_default(),
            generation_rules_history: serde_json::from_value(self.generation_rules_history)
                .unwrap_or_default(),
            force_regenerate_scene_ids: serde_json::from_value(self.force_regenerate_scene_ids)
                .unwrap_or_default(),
            assets,
            created_at: self.created_at,
            updated_at: self.updated_at,
            scenes: vec![],
            characters: vec![],
            locations: vec![],
        }
    }
}

const SCENE_SELECT: &str = "SELECT id, project_id, index, start_time, end_time, duration_secs, description, shot_type, camera_movement, lighting, mood, character_ids, location_id, status, continuity_state, error_message FROM scenes";

#[derive(sqlx::FromRow)]
struct SceneRow {
    id: Uuid,
    project_id: Uuid,
    index: i32,
    start_time: f64,
    end_time: f64,
    duration_secs: i64,
    description: String,
    shot_type: Option<String>,
    camera_movement: Option<String>,
    lighting: Option<String>,
    mood: Option<String>,
    character_ids: serde_json::Value,
    location_id: Option<Uuid>,
    status: String,
    continuity_state: serde_json::Value,
    error_message: Option<String>,
}

impl SceneRow {
    fn into_scene(self, assets: pipeline_types::ledger::AssetLedger) -> Scene {
        Scene {
            id: self.id,
            project_id: self.project_id,
            index: self.index as u32,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_secs: self.duration_secs,
            description: self.description,
            shot_type: self.shot_type,
            camera_movement: self.camera_movement,
            lighting: self.lighting,
            mood: self.mood,
            character_ids: serde_json::from_value(self.character_ids).unwrap_or_default(),
            location_id: self.location_id,
            status: scene_status_from_str(&self.status),
            continuity_state: self.continuity_state,
            assets,
            error_message: self.error_message,
        }
    }
}

const CHARACTER_SELECT: &str = "SELECT id, project_id, name, state FROM characters";

#[derive(sqlx::FromRow)]
struct CharacterRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    state: serde_json::Value,
}

impl CharacterRow {
    fn into_character(self, assets: pipeline_types::ledger::AssetLedger) -> Character {
        Character {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            state: self.state,
            assets,
        }
    }
}

const LOCATION_SELECT: &str = "SELECT id, project_id, name, state FROM locations";

#[derive(sqlx::FromRow)]
struct LocationRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    state: serde_json::Value,
}

impl LocationRow {
    fn into_location(self, assets: pipeline_types::ledger::AssetLedger) -> Location {
        Location {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            state: self.state,
            assets,
        }
    }
}
