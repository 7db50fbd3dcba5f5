//! Lifecycle Monitor (§4.5): a background sweep that reclaims jobs a
//! worker stopped heartbeating on, and promotes failed jobs back to
//! `DISPATCHED` on a backoff schedule until they exhaust `max_retries`.

use crate::store::JobStore;
use pipeline_config::LifecycleConfig;
use pipeline_db::DbPool;
use pipeline_types::job::JobState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct LifecycleMonitor {
    pool: Arc<DbPool>,
    store: Arc<JobStore>,
    config: LifecycleConfig,
    cancel: CancellationToken,
}

impl LifecycleMonitor {
    pub fn new(pool: Arc<DbPool>, store: Arc<JobStore>, config: LifecycleConfig) -> Self {
        Self {
            pool,
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the sweep loop. Returns a join handle; call `stop()` first to
    /// request a clean shutdown, then await the handle.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(monitor.config.reclaim_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = monitor.sweep_stalled().await {
                            tracing::warn!(error = %err, "stall sweep failed");
                        }
                        if let Err(err) = monitor.sweep_retryable().await {
                            tracing::warn!(error = %err, "retry sweep failed");
                        }
                    }
                    _ = monitor.cancel.cancelled() => break,
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Jobs stuck in `DISPATCHED`/`RUNNING` past `stall_timeout_ms` without
    /// a heartbeat are presumed abandoned by a dead worker (or never
    /// picked up) and returned straight to `DISPATCHED` with `attempt`
    /// unchanged — this is not a failed attempt, just a reclaim (§4.5, §7
    /// property 6).
    async fn sweep_stalled(&self) -> Result<(), crate::error::JobError> {
        let stall_timeout_ms = self.config.stall_timeout_ms as i64;
        let candidates: Vec<(Uuid, i32)> = self
            .pool
            .query("jobs::sweep_stalled_scan", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    SELECT id, attempt FROM jobs
                    WHERE state IN ('DISPATCHED', 'RUNNING')
                      AND last_heartbeat_at < now() - ($1 || ' milliseconds')::interval
                    "#,
                )
                .bind(stall_timeout_ms.to_string())
                .fetch_all(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        for (id, attempt) in candidates {
            if let Err(err) = self.store.requeue_stalled(id, attempt).await {
                tracing::debug!(job_id = %id, error = %err, "stall requeue raced, skipping");
            }
        }
        Ok(())
    }

    /// Jobs in `FAILED` wait out an exponential backoff (`2^attempt`
    /// seconds, capped implicitly by `max_retries`) before being
    /// redispatched. Once the retry budget is exhausted, the job is
    /// transitioned to `FATAL` instead (§4.5, §7).
    async fn sweep_retryable(&self) -> Result<(), crate::error::JobError> {
        let candidates: Vec<(Uuid, i32, i32)> = self
            .pool
            .query("jobs::sweep_retryable_scan", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    SELECT id, attempt, max_retries FROM jobs
                    WHERE state = 'FAILED'
                      AND updated_at < now() - (power(2, LEAST(attempt, 10))::text || ' seconds')::interval
                    "#,
                )
                .fetch_all(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        for (id, attempt, max_retries) in candidates {
            if attempt > max_retries {
                if let Err(err) = self
                    .store
                    .update_job_safe(id, attempt, JobState::Fatal, Some("max retries exceeded".into()))
                    .await
                {
                    tracing::debug!(job_id = %id, error = %err, "fatal transition raced, skipping");
                }
                continue;
            }
            if let Err(err) = self.store.redispatch_failed(id, attempt).await {
                tracing::debug!(job_id = %id, error = %err, "retry redispatch raced, skipping");
            }
        }
        Ok(())
    }
}
