use crate::bus::EventBus;
use crate::error::EventBusError;
use crate::message::Message;
use async_trait::async_trait;
use pipeline_db::DbPool;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Postgres-native event bus (§4.8): topics, subscriptions and messages
/// all live in tables on the same pool the rest of the core already uses,
/// with `attributes @> filter` JSONB containment doing the per-subscription
/// routing. Each named subscription has exactly one logical consumer, so
/// unlike the job queue's `claim_job` there is no competing-consumer race
/// for `poll` to guard against with `FOR UPDATE SKIP LOCKED`.
pub struct PgEventBus {
    pool: Arc<DbPool>,
}

impl PgEventBus {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    /// Deletes subscriptions whose TTL has lapsed. Intended to be called
    /// periodically by a background task, the same way the connection
    /// pool sweeps leaked acquisitions.
    pub async fn sweep_expired_subscriptions(&self) -> Result<u64, EventBusError> {
        let deleted = self
            .pool
            .query("eventbus::sweep_expired", move |mut conn| async move {
                sqlx::query("DELETE FROM event_subscriptions WHERE expires_at IS NOT NULL AND expires_at < now()")
                    .execute(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(deleted.rows_affected())
    }
}

#[async_trait]
impl EventBus for PgEventBus {
    async fn ensure_topic(&self, topic: &str) -> Result<(), EventBusError> {
        let topic = topic.to_string();
        self.pool
            .query("eventbus::ensure_topic", move |mut conn| async move {
                sqlx::query("INSERT INTO event_topics (name) VALUES ($1) ON CONFLICT DO NOTHING")
                    .bind(&topic)
                    .execute(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        attributes: HashMap<String, String>,
        payload: serde_json::Value,
    ) -> Result<(), EventBusError> {
        let id = Uuid::new_v4();
        let topic = topic.to_string();
        let attributes_json = serde_json::to_value(&attributes)?;

        self.pool
            .query("eventbus::publish", move |mut conn| async move {
                sqlx::query(
                    r#"
                    INSERT INTO event_messages (id, topic, attributes, payload, published_at)
                    VALUES ($1, $2, $3, $4, now())
                    "#,
                )
                .bind(id)
                .bind(&topic)
                .bind(&attributes_json)
                .bind(&payload)
                .execute(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    async fn ensure_subscription(
        &self,
        name: &str,
        topic: &str,
        attribute_filter: HashMap<String, String>,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), EventBusError> {
        let name = name.to_string();
        let topic = topic.to_string();
        let filter_json = serde_json::to_value(&attribute_filter)?;
        let ttl_ms = ttl.map(|d| d.as_millis() as i64);

        self.pool
            .query("eventbus::ensure_subscription", move |mut conn| async move {
                sqlx::query(
                    r#"
                    INSERT INTO event_subscriptions (name, topic, filter, last_seq, expires_at)
                    VALUES ($1, $2, $3, 0, CASE WHEN $4::bigint IS NULL THEN NULL ELSE now() + ($4 || ' milliseconds')::interval END)
                    ON CONFLICT (name) DO UPDATE
                        SET expires_at = CASE WHEN $4::bigint IS NULL THEN NULL ELSE now() + ($4 || ' milliseconds')::interval END
                    "#,
                )
                .bind(&name)
                .bind(&topic)
                .bind(&filter_json)
                .bind(ttl_ms)
                .execute(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    async fn poll(&self, subscription: &str) -> Result<Option<Message>, EventBusError> {
        let subscription = subscription.to_string();
        let row: Option<(i64, Uuid, String, serde_json::Value, serde_json::Value, chrono::DateTime<chrono::Utc>)> = self
            .pool
            .query("eventbus::poll", move |mut conn| async move {
                sqlx::query_as(
                    r#"
                    SELECT m.seq, m.id, m.topic, m.attributes, m.payload, m.published_at
                    FROM event_messages m
                    JOIN event_subscriptions s ON s.topic = m.topic
                    WHERE s.name = $1 AND m.seq > s.last_seq AND m.attributes @> s.filter
                    ORDER BY m.seq
                    LIMIT 1
                    "#,
                )
                .bind(&subscription)
                .fetch_optional(&mut *conn)
                .await
                .map_err(pipeline_db::PoolError::Query)
            })
            .await?;

        Ok(row.map(|(seq, id, topic, attributes, payload, published_at)| Message {
            seq,
            id,
            topic,
            attributes: serde_json::from_value(attributes).unwrap_or_default(),
            payload,
            published_at,
        }))
    }

    async fn ack(&self, subscription: &str, seq: i64) -> Result<(), EventBusError> {
        let subscription = subscription.to_string();
        self.pool
            .query("eventbus::ack", move |mut conn| async move {
                sqlx::query("UPDATE event_subscriptions SET last_seq = $2 WHERE name = $1 AND last_seq < $2")
                    .bind(&subscription)
                    .bind(seq)
                    .execute(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }

    async fn delete_subscription(&self, name: &str) -> Result<(), EventBusError> {
        let name = name.to_string();
        self.pool
            .query("eventbus::delete_subscription", move |mut conn| async move {
                sqlx::query("DELETE FROM event_subscriptions WHERE name = $1")
                    .bind(&name)
                    .execute(&mut *conn)
                    .await
                    .map_err(pipeline_db::PoolError::Query)
            })
            .await?;
        Ok(())
    }
}
