use std::time::Duration;

use moka::sync::Cache;

/// In-memory fast path in front of the durable idempotency store. Replays
/// served from here skip a database round trip; a miss only means the
/// durable store must be consulted, so eviction is always safe.
#[derive(Debug)]
pub struct InMemoryReplayCache {
    responses: Cache<String, serde_json::Value>,
}

impl InMemoryReplayCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
    pub const DEFAULT_CAPACITY: u64 = 100_000;

    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            responses: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.responses.get(key)
    }

    pub fn put(&self, key: &str, response: serde_json::Value) {
        self.responses.insert(key.to_string(), response);
    }
}

impl Default for InMemoryReplayCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}
