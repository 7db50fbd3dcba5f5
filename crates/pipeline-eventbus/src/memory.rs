use crate::bus::EventBus;
use crate::error::EventBusError;
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

struct StoredMessage {
    seq: i64,
    id: Uuid,
    topic: String,
    attributes: HashMap<String, String>,
    payload: serde_json::Value,
    published_at: chrono::DateTime<chrono::Utc>,
}

struct SubscriptionState {
    topic: String,
    filter: HashMap<String, String>,
    last_seq: i64,
}

#[derive(Default)]
struct Inner {
    messages: Vec<StoredMessage>,
    subscriptions: HashMap<String, SubscriptionState>,
}

/// In-memory stand-in for `PgEventBus`, used by tests that want bus
/// semantics (topics, filtered subscriptions, ack-to-advance) without a
/// database (§4.8).
pub struct InMemoryEventBus {
    inner: Mutex<Inner>,
    next_seq: AtomicI64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_seq: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(attributes: &HashMap<String, String>, filter: &HashMap<String, String>) -> bool {
    filter.iter().all(|(k, v)| attributes.get(k) == Some(v))
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn ensure_topic(&self, _topic: &str) -> Result<(), EventBusError> {
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        attributes: HashMap<String, String>,
        payload: serde_json::Value,
    ) -> Result<(), EventBusError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.messages.push(StoredMessage {
            seq,
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            attributes,
            payload,
            published_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn ensure_subscription(
        &self,
        name: &str,
        topic: &str,
        attribute_filter: HashMap<String, String>,
        _ttl: Option<std::time::Duration>,
    ) -> Result<(), EventBusError> {
        let mut inner = self.inner.lock().unwrap();
        inner.subscriptions.entry(name.to_string()).or_insert(SubscriptionState {
            topic: topic.to_string(),
            filter: attribute_filter,
            last_seq: 0,
        });
        Ok(())
    }

    async fn poll(&self, subscription: &str) -> Result<Option<Message>, EventBusError> {
        let inner = self.inner.lock().unwrap();
        let sub = inner
            .subscriptions
            .get(subscription)
            .ok_or_else(|| EventBusError::UnknownSubscription(subscription.to_string()))?;

        let found = inner
            .messages
            .iter()
            .filter(|m| m.topic == sub.topic && m.seq > sub.last_seq && matches_filter(&m.attributes, &sub.filter))
            .min_by_key(|m| m.seq);

        Ok(found.map(|m| Message {
            seq: m.seq,
            id: m.id,
            topic: m.topic.clone(),
            attributes: m.attributes.clone(),
            payload: m.payload.clone(),
            published_at: m.published_at,
        }))
    }

    async fn ack(&self, subscription: &str, seq: i64) -> Result<(), EventBusError> {
        let mut inner = self.inner.lock().unwrap();
        let sub = inner
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| EventBusError::UnknownSubscription(subscription.to_string()))?;
        if seq > sub.last_seq {
            sub.last_seq = seq;
        }
        Ok(())
    }

    async fn delete_subscription(&self, name: &str) -> Result<(), EventBusError> {
        self.inner.lock().unwrap().subscriptions.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_respects_attribute_filter() {
        let bus = InMemoryEventBus::new();
        bus.ensure_topic("job-events").await.unwrap();
        bus.ensure_subscription(
            "worker-a",
            "job-events",
            HashMap::from([("job_type".to_string(), "RENDER_VIDEO".to_string())]),
            None,
        )
        .await
        .unwrap();

        bus.publish(
            "job-events",
            HashMap::from([("job_type".to_string(), "FRAME_RENDER".to_string())]),
            serde_json::json!({"ignored": true}),
        )
        .await
        .unwrap();
        bus.publish(
            "job-events",
            HashMap::from([("job_type".to_string(), "RENDER_VIDEO".to_string())]),
            serde_json::json!({"matched": true}),
        )
        .await
        .unwrap();

        let message = bus.poll("worker-a").await.unwrap().expect("one message");
        assert_eq!(message.payload["matched"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn ack_advances_past_redelivery() {
        let bus = InMemoryEventBus::new();
        bus.ensure_topic("t").await.unwrap();
        bus.ensure_subscription("s", "t", HashMap::new(), None).await.unwrap();
        bus.publish("t", HashMap::new(), serde_json::json!(1)).await.unwrap();

        let first = bus.poll("s").await.unwrap().unwrap();
        assert_eq!(bus.poll("s").await.unwrap().unwrap().seq, first.seq);

        bus.ack("s", first.seq).await.unwrap();
        assert!(bus.poll("s").await.unwrap().is_none());
    }
}
