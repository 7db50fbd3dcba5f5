//! Distributed Lock Manager (§4.2): leases rows in the `locks` table so
//! that concurrent orchestrator processes can serialize access to a single
//! entity (a project, a scene, an asset ledger key) without a separate
//! coordination service.
//!
//! A lease that is never renewed or released expires on its own once
//! `expires_at` passes — the same fail-safe the job claim lease relies on
//! (§4.5) — so a crashed holder cannot wedge the lock forever.

use crate::error::LockError;
use pipeline_db::DbPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    pub holder: Uuid,
}

pub struct LockManager {
    pool: Arc<DbPool>,
}

impl LockManager {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Attempts to acquire `key` for `ttl`. Returns `Ok(None)` if another
    /// holder currently has an unexpired lease — the caller decides
    /// whether to retry, back off, or fail the command.
    pub async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let holder = Uuid::new_v4();
        let ttl_ms = ttl.as_millis() as i64;

        let row: Option<(Uuid,)> = self
            .pool
            .query("lock::try_acquire", |mut conn| async move {
                sqlx::query_as(
                    r#"
                    INSERT INTO locks (key, holder, expires_at)
                    VALUES ($1, $2, now() + ($3 || ' milliseconds')::interval)
                    ON CONFLICT (key) DO UPDATE
                        SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                        WHERE locks.expires_at < now()
                    RETURNING holder
                    "#,
                )
                .bind(key)
                .bind(holder)
                .bind(ttl_ms.to_string())
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        match row {
            Some((returned_holder,)) if returned_holder == holder => Ok(Some(LockHandle {
                key: key.to_string(),
                holder,
            })),
            _ => Ok(None),
        }
    }

    /// Extends an already-held lease. Fails with `NotHeld` if the lease
    /// expired and was taken by someone else in the meantime.
    pub async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<(), LockError> {
        let ttl_ms = ttl.as_millis() as i64;
        let key = handle.key.clone();
        let holder = handle.holder;

        let updated: Option<(String,)> = self
            .pool
            .query("lock::renew", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    UPDATE locks
                    SET expires_at = now() + ($1 || ' milliseconds')::interval
                    WHERE key = $2 AND holder = $3
                    RETURNING key
                    "#,
                )
                .bind(ttl_ms.to_string())
                .bind(&key)
                .bind(holder)
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        updated
            .map(|_| ())
            .ok_or_else(|| LockError::NotHeld(handle.key.clone(), handle.holder.to_string()))
    }

    /// Releases a held lease early. A no-op (not an error) if the lease
    /// already expired — the effect the caller wanted is already true.
    pub async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let key = handle.key.clone();
        let holder = handle.holder;
        self.pool
            .query("lock::release", move |mut conn| async move {
                sqlx::query("DELETE FROM locks WHERE key = $1 AND holder = $2")
                    .bind(&key)
                    .bind(holder)
                    .execute(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    /// Acquires `key`, runs `f`, and releases the lease regardless of
    /// whether `f` succeeded. Returns `Contended` without running `f` if
    /// the lock could not be acquired. Generic over the body's error type
    /// so callers with their own error enum don't need to round-trip
    /// through `LockError` first.
    pub async fn with_lock<F, Fut, T, E>(&self, key: &str, ttl: Duration, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let handle = self
            .try_acquire(key, ttl)
            .await?
            .ok_or_else(|| LockError::Contended(key.to_string()))?;

        let result = f().await;

        if let Err(err) = self.release(&handle).await {
            tracing::warn!(key, error = %err, "failed to release lock after with_lock body");
        }

        result
    }
}
