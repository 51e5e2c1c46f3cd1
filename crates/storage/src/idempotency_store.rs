use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, Set};
use visitproof_domain::storage::{IdempotencyStore, StorageError, StorageResult};

use crate::entity::idempotency_records;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl IdempotencyStore for SeaOrmStorage {
    async fn get_response(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<serde_json::Value>> {
        let maybe = idempotency_records::Entity::find_by_id(key.to_owned())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(maybe.and_then(|model| (model.expires_at > now).then_some(model.response)))
    }

    async fn put_response(
        &self,
        key: &str,
        response: &serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let model = idempotency_records::ActiveModel {
            key: Set(key.to_owned()),
            response: Set(response.clone()),
            expires_at: Set(expires_at),
        };
        idempotency_records::Entity::insert(model)
            .on_conflict(
                OnConflict::column(idempotency_records::Column::Key)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let result = idempotency_records::Entity::delete_many()
            .filter(idempotency_records::Column::ExpiresAt.lte(now))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }
}
