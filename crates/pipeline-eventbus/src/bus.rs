use crate::error::EventBusError;
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;

/// Event Bus Adapter (§4.8): the seam between the core and whatever
/// message transport a deployment runs. `PgEventBus` is the production
/// implementation; `InMemoryEventBus` backs unit tests that don't want a
/// database in the loop.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Idempotent: safe to call on every startup.
    async fn ensure_topic(&self, topic: &str) -> Result<(), EventBusError>;

    async fn publish(
        &self,
        topic: &str,
        attributes: HashMap<String, String>,
        payload: serde_json::Value,
    ) -> Result<(), EventBusError>;

    /// Creates `name` as a subscription to `topic` if it doesn't already
    /// exist, filtered to messages whose attributes are a superset of
    /// `attribute_filter`. `ttl` makes the subscription ephemeral: it is
    /// eligible for cleanup once `ttl` elapses without renewal, which is
    /// how a worker's per-process subscription doesn't outlive the worker
    /// (§4.8).
    async fn ensure_subscription(
        &self,
        name: &str,
        topic: &str,
        attribute_filter: HashMap<String, String>,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), EventBusError>;

    /// Pulls the next unacked message for `subscription`, or `None` if
    /// none is currently available.
    async fn poll(&self, subscription: &str) -> Result<Option<Message>, EventBusError>;

    /// Advances `subscription`'s cursor past `seq`. Until acked, the
    /// message is redelivered on the next `poll` (at-least-once, §7).
    async fn ack(&self, subscription: &str, seq: i64) -> Result<(), EventBusError>;

    /// Deletes a subscription outright — called on a worker's graceful
    /// shutdown so it doesn't linger as a dead ephemeral subscription
    /// until its TTL expires (§4.8).
    async fn delete_subscription(&self, name: &str) -> Result<(), EventBusError>;
}
