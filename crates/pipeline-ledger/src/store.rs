use crate::error::LedgerError;
use crate::one_or_many::OneOrMany;
use crate::scope::Scope;
use pipeline_db::DbPool;
use pipeline_lock::LockManager;
use pipeline_types::ledger::{AssetLedgerEntry, AssetVersion, AssetVersionMetadata, AssetVersionType};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const LOCK_TTL: Duration = Duration::from_secs(10);

/// Caller-supplied payload for one new version; `createVersionedAssets`
/// assigns the sequential `version` number itself (§4.3 — callers never
/// pick their own version numbers, which is what keeps the ledger
/// append-only).
#[derive(Debug, Clone, Deserialize)]
pub struct NewAssetVersion {
    pub version_type: AssetVersionType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: AssetVersionMetadata,
    /// Whether this version should become `best` once appended (§4.3's
    /// `setBest`). An empty ledger adopts its first version as `best`
    /// regardless of this flag — §3's invariant `best == 0` iff `versions`
    /// is empty must hold the instant the first version lands.
    #[serde(default)]
    pub set_best: bool,
}

/// Asset Version Ledger (§4.3): every (scope, entity, asset key) triple
/// owns one append-only row. Mutation always happens under a per-row lock
/// obtained from `pipeline-lock` so concurrent writers (a worker completing
/// a job, a human retry) cannot interleave and violate the head/best
/// invariants.
pub struct LedgerStore {
    pool: Arc<DbPool>,
    locks: Arc<LockManager>,
}

impl LedgerStore {
    pub fn new(pool: Arc<DbPool>, locks: Arc<LockManager>) -> Self {
        Self { pool, locks }
    }

    fn lock_key(scope: Scope, entity_id: Uuid, asset_key: &str) -> String {
        format!("ledger:{scope}:{entity_id}:{asset_key}")
    }

    async fn load(
        &self,
        scope: Scope,
        entity_id: Uuid,
        asset_key: &str,
    ) -> Result<AssetLedgerEntry, LedgerError> {
        let scope_str = scope.to_string();
        let asset_key = asset_key.to_string();
        let row: Option<(serde_json::Value,)> = self
            .pool
            .query("ledger::load", move |mut conn| async move {
                sqlx::query_as(
                    "SELECT versions_json FROM asset_ledgers \
                     WHERE scope = $1 AND entity_id = $2 AND asset_key = $3",
                )
                .bind(&scope_str)
                .bind(entity_id)
                .bind(&asset_key)
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        match row {
            Some((json,)) => Ok(serde_json::from_value(json)?),
            None => Ok(AssetLedgerEntry::default()),
        }
    }

    async fn save(
        &self,
        scope: Scope,
        entity_id: Uuid,
        asset_key: &str,
        entry: &AssetLedgerEntry,
    ) -> Result<(), LedgerError> {
        let scope_str = scope.to_string();
        let asset_key = asset_key.to_string();
        let json = serde_json::to_value(entry)?;
        let head = entry.head as i32;
        let best = entry.best as i32;

        self.pool
            .query("ledger::save", move |mut conn| async move {
                sqlx::query(
                    r#"
                    INSERT INTO asset_ledgers (scope, entity_id, asset_key, head, best, versions_json, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, now())
                    ON CONFLICT (scope, entity_id, asset_key) DO UPDATE
                        SET head = EXCLUDED.head,
                            best = EXCLUDED.best,
                            versions_json = EXCLUDED.versions_json,
                            updated_at = now()
                    "#,
                )
                .bind(&scope_str)
                .bind(entity_id)
                .bind(&asset_key)
                .bind(head)
                .bind(best)
                .bind(&json)
                .execute(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    /// Appends one or more versions, returning them in assigned order.
    /// `best` advances to the newly appended version whenever the ledger
    /// was empty (so `best == 0` iff `versions` is empty always holds,
    /// §3) or the caller set `set_best` on that input (§4.3); otherwise it
    /// is left untouched. Explicit `set_best_version` calls remain the
    /// only way to point `best` at anything other than the most recent
    /// append.
    pub async fn create_versioned_assets(
        &self,
        scope: Scope,
        entity_id: Uuid,
        asset_key: &str,
        job_id: Option<Uuid>,
        inputs: OneOrMany<NewAssetVersion>,
    ) -> Result<Vec<AssetVersion>, LedgerError> {
        let key = Self::lock_key(scope, entity_id, asset_key);
        let asset_key_owned = asset_key.to_string();

        self.locks
            .with_lock(&key, LOCK_TTL, || async {
                let mut entry = self.load(scope, entity_id, &asset_key_owned).await?;
                let mut created = Vec::new();

                for input in inputs.into_vec() {
                    let mut metadata = input.metadata;
                    if metadata.job_id.is_none() {
                        metadata.job_id = job_id;
                    }
                    let set_best = entry.best == 0 || input.set_best;
                    let version = AssetVersion {
                        version: entry.next_version_number(),
                        version_type: input.version_type,
                        data: input.data,
                        metadata,
                        created_at: chrono::Utc::now(),
                    };
                    entry.head = version.version;
                    if set_best {
                        entry.best = version.version;
                    }
                    entry.versions.push(version.clone());
                    created.push(version);
                }

                self.save(scope, entity_id, &asset_key_owned, &entry).await?;
                Ok(created)
            })
            .await
    }

    pub async fn get_next_version_number(
        &self,
        scope: Scope,
        entity_id: Uuid,
        asset_key: &str,
    ) -> Result<u32, LedgerError> {
        let entry = self.load(scope, entity_id, asset_key).await?;
        Ok(entry.next_version_number())
    }

    pub async fn get_best_version(
        &self,
        scope: Scope,
        entity_id: Uuid,
        asset_key: &str,
    ) -> Result<Option<AssetVersion>, LedgerError> {
        let entry = self.load(scope, entity_id, asset_key).await?;
        Ok(entry.best_version().cloned())
    }

    /// Moves the `best` pointer. Rejects a version number that was never
    /// appended — `best` must always reference a real entry (§3).
    pub async fn set_best_version(
        &self,
        scope: Scope,
        entity_id: Uuid,
        asset_key: &str,
        version: u32,
    ) -> Result<(), LedgerError> {
        let key = Self::lock_key(scope, entity_id, asset_key);
        let asset_key_owned = asset_key.to_string();

        self.locks
            .with_lock(&key, LOCK_TTL, || async {
                let mut entry = self.load(scope, entity_id, &asset_key_owned).await?;
                if !entry.versions.iter().any(|v| v.version == version) {
                    return Err(LedgerError::UnknownVersion(version));
                }
                entry.best = version;
                self.save(scope, entity_id, &asset_key_owned, &entry).await?;
                Ok(())
            })
            .await
    }

    /// Merges `patch` fields into a version's `metadata.extra`. Never
    /// touches `data` or `version_type` — those are immutable once
    /// appended (§4.3).
    pub async fn update_version_metadata(
        &self,
        scope: Scope,
        entity_id: Uuid,
        asset_key: &str,
        version: u32,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LedgerError> {
        let key = Self::lock_key(scope, entity_id, asset_key);
        let asset_key_owned = asset_key.to_string();

        self.locks
            .with_lock(&key, LOCK_TTL, || async {
                let mut entry = self.load(scope, entity_id, &asset_key_owned).await?;
                let target = entry
                    .versions
                    .iter_mut()
                    .find(|v| v.version == version)
                    .ok_or(LedgerError::UnknownVersion(version))?;
                for (k, v) in patch {
                    target.metadata.extra.insert(k, v);
                }
                self.save(scope, entity_id, &asset_key_owned, &entry).await?;
                Ok(())
            })
            .await
    }
}
