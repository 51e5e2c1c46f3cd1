//! Run-exactly-once-per-key wrapper used by every mutating endpoint.
//!
//! The guard caches the serialized first response per caller-supplied key
//! and replays it on retries. Cache infrastructure failures fail open: the
//! wrapped operation runs anyway, because the operations themselves carry
//! their own natural idempotency through their state machines. The guard
//! provides no atomicity against two identical first-calls racing before
//! either has cached; that guarantee also lives in the state machines.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::services::cache::InMemoryReplayCache;
use crate::storage::IdempotencyStore;

/// Result of a guarded call: the value plus whether it was replayed from
/// cache rather than freshly computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardOutcome<T> {
    pub replayed: bool,
    pub value: T,
}

pub struct IdempotencyGuard<S> {
    store: Arc<S>,
    memory: Arc<InMemoryReplayCache>,
    ttl: Duration,
}

impl<S> Clone for IdempotencyGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            memory: Arc::clone(&self.memory),
            ttl: self.ttl,
        }
    }
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
    pub fn new(store: Arc<S>, memory: Arc<InMemoryReplayCache>, ttl: Duration) -> Self {
        Self { store, memory, ttl }
    }

    /// Runs `op` at most once per `key`; replays the cached response on
    /// later calls with the same key. All replays are byte-identical to the
    /// first response because the serialized form is what gets cached.
    pub async fn run<T, E, F, Fut>(&self, key: &str, op: F) -> Result<GuardOutcome<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.memory.get(key) {
            if let Ok(value) = serde_json::from_value::<T>(cached) {
                counter!("idempotency_requests_total", 1, "outcome" => "replay_memory");
                return Ok(GuardOutcome {
                    replayed: true,
                    value,
                });
            }
        }

        let now = Utc::now();
        match self.store.get_response(key, now).await {
            Ok(Some(cached)) => {
                if let Ok(value) = serde_json::from_value::<T>(cached.clone()) {
                    self.memory.put(key, cached);
                    counter!("idempotency_requests_total", 1, "outcome" => "replay_store");
                    return Ok(GuardOutcome {
                        replayed: true,
                        value,
                    });
                }
                warn!(key, "cached idempotency response failed to deserialize");
            }
            Ok(None) => {}
            Err(err) => {
                counter!("idempotency_cache_failures_total", 1, "op" => "read");
                warn!(key, ?err, "idempotency cache read failed, failing open");
            }
        }

        counter!("idempotency_requests_total", 1, "outcome" => "miss");
        let value = op().await?;

        match serde_json::to_value(&value) {
            Ok(serialized) => {
                let expires_at = now + self.ttl;
                if let Err(err) = self.store.put_response(key, &serialized, expires_at).await {
                    counter!("idempotency_cache_failures_total", 1, "op" => "write");
                    warn!(key, ?err, "idempotency cache write failed, failing open");
                }
                self.memory.put(key, serialized);
            }
            Err(err) => {
                warn!(key, ?err, "response not serializable, skipping idempotency cache");
            }
        }

        Ok(GuardOutcome {
            replayed: false,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageError, StorageResult};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<HashMap<String, (serde_json::Value, DateTime<Utc>)>>,
        fail_reads: bool,
        fail_writes: bool,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl IdempotencyStore for MemoryStore {
        async fn get_response(
            &self,
            key: &str,
            now: DateTime<Utc>,
        ) -> StorageResult<Option<serde_json::Value>> {
            if self.fail_reads {
                return Err(StorageError::Database("read down".into()));
            }
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(key)
                .filter(|(_, expires)| *expires > now)
                .map(|(value, _)| value.clone()))
        }

        async fn put_response(
            &self,
            key: &str,
            response: &serde_json::Value,
            expires_at: DateTime<Utc>,
        ) -> StorageResult<()> {
            if self.fail_writes {
                return Err(StorageError::Database("write down".into()));
            }
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.rows
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_insert((response.clone(), expires_at));
            Ok(())
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|_, (_, expires)| *expires > now);
            Ok((before - rows.len()) as u64)
        }
    }

    fn guard(store: MemoryStore) -> (IdempotencyGuard<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(store);
        (
            IdempotencyGuard::new(
                Arc::clone(&store),
                Arc::new(InMemoryReplayCache::default()),
                Duration::hours(24),
            ),
            store,
        )
    }

    #[tokio::test]
    async fn second_call_replays_without_invoking_op() {
        let (guard, _store) = guard(MemoryStore::default());
        let calls = AtomicUsize::new(0);

        let first: GuardOutcome<String> = guard
            .run("k1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StorageError>("result".to_string())
            })
            .await
            .unwrap();
        let second: GuardOutcome<String> = guard
            .run("k1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StorageError>("different".to_string())
            })
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.value, "result");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_survives_memory_eviction() {
        let (guard, store) = guard(MemoryStore::default());

        let _: GuardOutcome<i64> = guard
            .run("k2", || async { Ok::<_, StorageError>(41) })
            .await
            .unwrap();

        // Fresh guard over the same durable store simulates a new replica.
        let other = IdempotencyGuard::new(
            store,
            Arc::new(InMemoryReplayCache::default()),
            Duration::hours(24),
        );
        let outcome: GuardOutcome<i64> = other
            .run("k2", || async { Ok::<_, StorageError>(99) })
            .await
            .unwrap();
        assert!(outcome.replayed);
        assert_eq!(outcome.value, 41);
    }

    #[tokio::test]
    async fn read_failure_fails_open() {
        let (guard, _store) = guard(MemoryStore {
            fail_reads: true,
            ..Default::default()
        });
        let outcome: GuardOutcome<i64> = guard
            .run("k3", || async { Ok::<_, StorageError>(7) })
            .await
            .unwrap();
        assert!(!outcome.replayed);
        assert_eq!(outcome.value, 7);
    }

    #[tokio::test]
    async fn write_failure_still_returns_value() {
        let (guard, _store) = guard(MemoryStore {
            fail_writes: true,
            ..Default::default()
        });
        let outcome: GuardOutcome<i64> = guard
            .run("k4", || async { Ok::<_, StorageError>(8) })
            .await
            .unwrap();
        assert_eq!(outcome.value, 8);
    }

    #[tokio::test]
    async fn op_error_is_not_cached() {
        let (guard, store) = guard(MemoryStore::default());
        let result: Result<GuardOutcome<i64>, StorageError> = guard
            .run("k5", || async { Err(StorageError::Database("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);

        let outcome: GuardOutcome<i64> = guard
            .run("k5", || async { Ok::<_, StorageError>(5) })
            .await
            .unwrap();
        assert!(!outcome.replayed);
        assert_eq!(outcome.value, 5);
    }
}
