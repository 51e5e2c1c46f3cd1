//! SeaORM-backed storage adapters that satisfy the domain storage traits
//! while keeping the database backend swappable (SQLite by default,
//! PostgreSQL via feature flag). Every state transition is a conditional
//! `UPDATE ... WHERE status = ... RETURNING` so concurrent replicas race on
//! the row itself rather than on in-process locks.

mod builder;
mod counter_store;
mod entity;
mod idempotency_store;
mod migration;
mod place_store;
mod receipt_store;
mod settlement_store;
mod token_store;
mod verification_store;

use std::sync::Arc;

use builder::StorageBuilder;
use migration::run_migrations;
use sea_orm::sea_query::{PostgresQueryBuilder, SqliteQueryBuilder, UpdateStatement};
use sea_orm::{
    ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, FromQueryResult, Statement,
};
use visitproof_domain::storage::{StorageError, StorageResult};

/// Shared storage handle used by the HTTP API and settlement services.
#[derive(Clone)]
pub struct SeaOrmStorage {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStorage {
    /// Connects to the provided database URL and ensures the schema is present.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let db = Database::connect(database_url)
            .await
            .map_err(StorageError::from_source)?;
        run_migrations(&db).await?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    pub(crate) fn from_connection(db: DatabaseConnection) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }
}

/// Runs a conditional update and returns the updated row, or `None` when the
/// condition did not match (the caller lost the transition race).
pub(crate) async fn update_returning_one<M>(
    db: &DatabaseConnection,
    mut query: UpdateStatement,
) -> StorageResult<Option<M>>
where
    M: FromQueryResult,
{
    let backend = db.get_database_backend();
    query.returning_all();

    let (sql, values) = match backend {
        DatabaseBackend::Sqlite => query.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => query.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => unreachable!("mysql backend is not supported"),
    };
    let stmt = Statement::from_sql_and_values(backend, sql, values);
    let maybe_row = db
        .query_one(stmt)
        .await
        .map_err(StorageError::from_source)?;

    maybe_row
        .map(|row| M::from_query_result(&row, "").map_err(StorageError::from_source))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use visitproof_domain::model::{
        hash_qr_code, CodeHash, MediaUrl, NewQrToken, PlaceId, SettlementPayload,
        SettlementStatus, TokenStatus, UserId,
    };
    use visitproof_domain::storage::{
        CounterStore, IdempotencyStore, ReceiptStore, SettlementStore, TokenStore,
    };

    async fn storage() -> SeaOrmStorage {
        SeaOrmStorage::connect("sqlite::memory:")
            .await
            .expect("storage inits")
    }

    async fn seed_token(storage: &SeaOrmStorage) -> CodeHash {
        let code_hash = hash_qr_code("printed-code");
        storage
            .insert_token(NewQrToken {
                code_hash: code_hash.clone(),
                place_id: PlaceId::new("p1"),
                ttl_sec: 600,
                created_at: Utc::now(),
            })
            .await
            .expect("token inserts");
        code_hash
    }

    #[tokio::test]
    async fn begin_processing_wins_only_once() {
        let storage = storage().await;
        let code_hash = seed_token(&storage).await;

        let winner = storage.begin_processing(&code_hash).await.unwrap();
        assert!(winner.is_some());
        assert_eq!(winner.unwrap().status, TokenStatus::Processing);

        let loser = storage.begin_processing(&code_hash).await.unwrap();
        assert!(loser.is_none());
    }

    #[tokio::test]
    async fn success_transition_stamps_usage() {
        let storage = storage().await;
        let code_hash = seed_token(&storage).await;
        storage.begin_processing(&code_hash).await.unwrap();

        let used_at = Utc::now();
        let updated = storage
            .complete_success(&code_hash, &UserId::new("u1"), used_at, 30)
            .await
            .unwrap()
            .expect("transition succeeds");
        assert_eq!(updated.status, TokenStatus::Success);
        assert_eq!(updated.used_by, Some(UserId::new("u1")));
        assert_eq!(updated.distance_m, Some(30));

        // Terminal states accept no further transitions.
        let again = storage
            .complete_failed(&code_hash, "GEOFENCE", None)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn expire_stuck_sweeps_old_nonterminal_tokens() {
        let storage = storage().await;
        let code_hash = seed_token(&storage).await;
        storage.begin_processing(&code_hash).await.unwrap();

        let moved = storage
            .expire_stuck(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(moved, 1);
        let token = storage.find_token(&code_hash).await.unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Expired);
    }

    #[tokio::test]
    async fn counter_windows_reset_after_expiry() {
        let storage = storage().await;
        let now = Utc::now();
        let window = Duration::seconds(60);

        for expected in 1..=3 {
            let count = storage.increment("qr:abc", window, now).await.unwrap();
            assert_eq!(count.count, expected);
        }

        let later = now + Duration::seconds(61);
        let fresh = storage.increment("qr:abc", window, later).await.unwrap();
        assert_eq!(fresh.count, 1);
        assert!(fresh.window_expires_at > later);
    }

    #[tokio::test]
    async fn idempotency_first_write_wins() {
        let storage = storage().await;
        let now = Utc::now();
        let expires = now + Duration::hours(24);

        storage
            .put_response("k1", &serde_json::json!({"state": "success"}), expires)
            .await
            .unwrap();
        storage
            .put_response("k1", &serde_json::json!({"state": "other"}), expires)
            .await
            .unwrap();

        let cached = storage.get_response("k1", now).await.unwrap();
        assert_eq!(cached, Some(serde_json::json!({"state": "success"})));

        let expired = storage
            .get_response("k1", expires + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(expired, None);
    }

    #[tokio::test]
    async fn settlement_enqueue_collapses_duplicates() {
        let storage = storage().await;
        let payload = SettlementPayload {
            user_id: UserId::new("u1"),
            place_id: PlaceId::new("p1"),
            mission_id: visitproof_domain::model::MissionId::new("m1"),
            amount: 500,
        };
        let now = Utc::now();

        assert!(storage.enqueue("key-1", &payload, now).await.unwrap());
        assert!(!storage.enqueue("key-1", &payload, now).await.unwrap());

        let claimed = storage.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, SettlementStatus::InFlight);

        // Already in flight: nothing left to claim.
        assert!(storage.claim_due(now, 10).await.unwrap().is_empty());

        storage.mark_done("key-1").await.unwrap();
        let job = storage.find_job("key-1").await.unwrap().unwrap();
        assert_eq!(job.status, SettlementStatus::Done);
    }

    #[tokio::test]
    async fn settlement_retry_and_dead_letter_flow() {
        let storage = storage().await;
        let payload = SettlementPayload {
            user_id: UserId::new("u1"),
            place_id: PlaceId::new("p1"),
            mission_id: visitproof_domain::model::MissionId::new("m1"),
            amount: 500,
        };
        let now = Utc::now();
        storage.enqueue("key-2", &payload, now).await.unwrap();
        storage.claim_due(now, 10).await.unwrap();

        let retry_at = now + Duration::seconds(30);
        storage
            .mark_retry("key-2", "sink 503", retry_at)
            .await
            .unwrap();
        let job = storage.find_job("key-2").await.unwrap().unwrap();
        assert_eq!(job.status, SettlementStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("sink 503"));

        // Not due yet.
        assert!(storage.claim_due(now, 10).await.unwrap().is_empty());
        let due = storage
            .claim_due(retry_at + Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        storage.mark_dead("key-2", "exhausted").await.unwrap();
        let dead = storage.find_job("key-2").await.unwrap().unwrap();
        assert_eq!(dead.status, SettlementStatus::DeadLettered);
        assert_eq!(dead.payload, payload);
    }

    #[tokio::test]
    async fn receipt_begin_ocr_claims_once() {
        let storage = storage().await;
        let user = UserId::new("u1");
        let place = PlaceId::new("p1");
        let media = MediaUrl::new("https://cdn.example/r1.jpg");
        let now = Utc::now();

        let first = storage.begin_ocr(&user, &place, &media, now).await.unwrap();
        assert!(first.is_some());
        let second = storage.begin_ocr(&user, &place, &media, now).await.unwrap();
        assert!(second.is_none());
    }
}
