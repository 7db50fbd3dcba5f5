//! Asset version ledger types (§3, §4.3 of the spec).
//!
//! A ledger is append-only: `versions` is only ever pushed to, and `head`
//! only ever increases. `best` is the one mutable pointer, and it must
//! always reference an existing version (or be `0` when the ledger is
//! empty).

use serde::{Deserialize, Serialize};

/// Well-known asset keys. Kept as a string newtype rather than a closed enum
/// because new asset kinds are expected to be added by generative-agent
/// integrations the core never needs to recompile for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(pub String);

impl AssetKey {
    pub const CHARACTER_IMAGE: &'static str = "character_image";
    pub const SCENE_START_FRAME: &'static str = "scene_start_frame";
    pub const SCENE_END_FRAME: &'static str = "scene_end_frame";
    pub const SCENE_VIDEO: &'static str = "scene_video";
    pub const RENDER_VIDEO: &'static str = "render_video";
    pub const STORYBOARD: &'static str = "storyboard";
    pub const SCENE_PROMPT: &'static str = "scene_prompt";
    pub const AUDIO_ANALYSIS: &'static str = "audio_analysis";

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AssetKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetVersionType {
    Text,
    Image,
    Video,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetVersionMetadata {
    pub job_id: Option<uuid::Uuid>,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub evaluation: Option<serde_json::Value>,
    /// Any additional fields a caller attached via `updateVersionMetadata`.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One immutable append to the ledger. `data` and `version_type` never
/// change after creation; only `metadata` may be merged post-append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetVersion {
    pub version: u32,
    pub version_type: AssetVersionType,
    /// A URI for binary media, or inline text/JSON for small payloads.
    /// Binary artifact storage itself is out of scope (§1).
    pub data: serde_json::Value,
    pub metadata: AssetVersionMetadata,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Append-only versioned history for one `(entity, assetKey)` pair.
///
/// Invariants (spec §3): `head >= best >= 0`; `best == 0` iff `versions` is
/// empty; `versions[i].version == i + 1`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetLedgerEntry {
    pub head: u32,
    pub best: u32,
    pub versions: Vec<AssetVersion>,
}

impl AssetLedgerEntry {
    pub fn best_version(&self) -> Option<&AssetVersion> {
        if self.best == 0 {
            return None;
        }
        self.versions.iter().find(|v| v.version == self.best)
    }

    pub fn next_version_number(&self) -> u32 {
        self.head + 1
    }

    /// Validates the append-only invariants. Used defensively at the
    /// repository boundary after deserializing from storage.
    pub fn is_consistent(&self) -> bool {
        if self.head < self.best {
            return false;
        }
        if self.best == 0 && !self.versions.is_empty() {
            return false;
        }
        if self.best != 0 && self.versions.iter().all(|v| v.version != self.best) {
            return false;
        }
        self.versions
            .iter()
            .enumerate()
            .all(|(i, v)| v.version as usize == i + 1)
    }
}

/// The full set of asset ledgers owned by one entity (project, scene,
/// character, or location), keyed by asset key.
pub type AssetLedger = std::collections::HashMap<String, AssetLedgerEntry>;
