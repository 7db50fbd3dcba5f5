use std::collections::HashMap;
use uuid::Uuid;

/// A delivered message: `seq` is the adapter's internal ordering cursor
/// (a Postgres `BIGSERIAL` id in `PgEventBus`, an in-memory counter in
/// `InMemoryEventBus`), not something callers should interpret.
#[derive(Debug, Clone)]
pub struct Message {
    pub seq: i64,
    pub id: Uuid,
    pub topic: String,
    pub attributes: HashMap<String, String>,
    pub payload: serde_json::Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}
