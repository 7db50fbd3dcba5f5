use crate::breaker::CircuitBreaker;
use crate::error::{classify, ErrorClass, PoolError};
use crate::leak::LeakRegistry;
use pipeline_config::OrchestratorConfig;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct Metrics {
    acquisitions: AtomicU64,
    acquire_failures: AtomicU64,
    slow_queries: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            acquisitions: AtomicU64::new(0),
            acquire_failures: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
        }
    }
}

/// Owns the only database pool in the process (§4.1, §9 "global state").
///
/// Wraps `sqlx::PgPool` with a circuit breaker, an acquisition leak
/// registry, and health-check/leak-sweep background tasks started by
/// `start_background_tasks`.
pub struct DbPool {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
    leaks: Arc<LeakRegistry>,
    metrics: Arc<Metrics>,
    acquire_timeout: Duration,
    slow_query_threshold: Duration,
    leak_warn_secs: u64,
    shutdown: Arc<Notify>,
}

/// RAII guard around a leased connection: releases the underlying
/// connection back to `sqlx::PgPool` and clears the leak-registry entry on
/// drop, on every exit path including early `?` returns (§9).
pub struct Acquired {
    conn: Option<PoolConnection<Postgres>>,
    leaks: Arc<LeakRegistry>,
    leak_id: u64,
}

impl Deref for Acquired {
    type Target = PoolConnection<Postgres>;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for Acquired {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for Acquired {
    fn drop(&mut self) {
        self.leaks.release(self.leak_id);
    }
}

impl DbPool {
    pub async fn connect(config: &OrchestratorConfig) -> Result<Self, PoolError> {
        let pool_cfg = config.pool();
        let pool = PgPoolOptions::new()
            .min_connections(pool_cfg.min)
            .max_connections(pool_cfg.max)
            .acquire_timeout(Duration::from_millis(pool_cfg.acquire_timeout_ms))
            .connect(&config.database_url)
            .await
            .map_err(PoolError::Query)?;

        Ok(Self {
            pool,
            breaker: Arc::new(CircuitBreaker::new(config.breaker())),
            leaks: Arc::new(LeakRegistry::new()),
            metrics: Arc::new(Metrics::new()),
            acquire_timeout: Duration::from_millis(pool_cfg.acquire_timeout_ms),
            slow_query_threshold: Duration::from_millis(pool_cfg.slow_query_ms),
            leak_warn_secs: pool_cfg.leak_warn_secs,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn sqlx_pool(&self) -> &PgPool {
        &self.pool
    }

    /// Acquires a connection, failing fast with `BreakerOpen` if the
    /// breaker has tripped, and recording the outcome against the breaker
    /// (§4.1).
    pub async fn acquire(&self, caller: &str) -> Result<Acquired, PoolError> {
        if !self.breaker.allow_request() {
            return Err(PoolError::BreakerOpen);
        }

        let started = Instant::now();
        match self.pool.acquire().await {
            Ok(conn) => {
                self.breaker.record_success();
                self.metrics.acquisitions.fetch_add(1, Ordering::Relaxed);
                if started.elapsed() > self.acquire_timeout / 2 {
                    tracing::warn!(
                        caller,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "slow connection acquisition"
                    );
                }
                let leak_id = self.leaks.track(caller);
                Ok(Acquired {
                    conn: Some(conn),
                    leaks: self.leaks.clone(),
                    leak_id,
                })
            }
            Err(err) => {
                self.metrics.acquire_failures.fetch_add(1, Ordering::Relaxed);
                if classify(&err) == ErrorClass::ConnectionOrTimeout {
                    self.breaker.record_connection_error();
                    Err(PoolError::Transient(err.to_string()))
                } else {
                    Err(PoolError::Query(err))
                }
            }
        }
    }

    /// Runs `SELECT 1` as both a health check and a breaker probe.
    pub async fn health_check(&self) -> Result<(), PoolError> {
        let mut conn = self.acquire("health_check").await?;
        let result = sqlx::query("SELECT 1").execute(&mut *conn).await;
        match result {
            Ok(_) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(err) => {
                if classify(&err) == ErrorClass::ConnectionOrTimeout {
                    self.breaker.record_connection_error();
                    Err(PoolError::Transient(err.to_string()))
                } else {
                    Err(PoolError::Query(err))
                }
            }
        }
    }

    /// Spawns the periodic health-check + leak-sweep background tasks.
    /// Both stop when `shutdown()` is called.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let health = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = health.health_check().await {
                            tracing::warn!(error = %err, "pool health check failed");
                        }
                    }
                    _ = health.shutdown.notified() => break,
                }
            }
        });

        let leak = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for (id, caller, held_secs) in leak.leaks.sweep(leak.leak_warn_secs) {
                            tracing::warn!(
                                acquisition_id = id,
                                caller,
                                held_secs,
                                "connection held longer than leak threshold"
                            );
                        }
                    }
                    _ = leak.shutdown.notified() => break,
                }
            }
        });
    }

    /// Executes `query` against a fresh acquisition, classifying it as a
    /// slow query if it exceeds the configured threshold.
    pub async fn query<F, Fut, T>(&self, caller: &str, query: F) -> Result<T, PoolError>
    where
        F: FnOnce(Acquired) -> Fut,
        Fut: std::future::Future<Output = Result<T, PoolError>>,
    {
        let conn = self.acquire(caller).await?;
        let started = Instant::now();
        let result = query(conn).await;
        let elapsed = started.elapsed();
        if elapsed > self.slow_query_threshold {
            self.metrics.slow_queries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(caller, elapsed_ms = elapsed.as_millis() as u64, "slow query");
        }
        result
    }

    /// Waits up to `deadline` for the pool to drain in-flight acquisitions
    /// before forcing closure, and stops background tasks (§4.1, §9).
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutdown.notify_waiters();
        let started = Instant::now();
        while self.leaks.live_count() > 0 && started.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.pool.close().await;
    }
}
