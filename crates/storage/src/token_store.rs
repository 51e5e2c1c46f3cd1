use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Query};
use sea_orm::{ActiveEnum, ColumnTrait, EntityTrait, QueryFilter, Set};
use visitproof_domain::model::{
    CodeHash, NewQrToken, PlaceId, QrTokenRecord, TokenStatus, UserId,
};
use visitproof_domain::storage::{StorageError, StorageResult, TokenStore};

use crate::entity::qr_tokens::{self, TokenStatusDb};
use crate::{update_returning_one, SeaOrmStorage};

#[async_trait::async_trait]
impl TokenStore for SeaOrmStorage {
    async fn insert_token(&self, token: NewQrToken) -> StorageResult<QrTokenRecord> {
        let model = qr_tokens::ActiveModel {
            code_hash: Set(token.code_hash.as_str().to_owned()),
            place_id: Set(token.place_id.as_str().to_owned()),
            status: Set(TokenStatusDb::Pending),
            ttl_sec: Set(token.ttl_sec),
            created_at: Set(token.created_at),
            ..Default::default()
        };
        qr_tokens::Entity::insert(model)
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;

        Ok(QrTokenRecord {
            code_hash: token.code_hash,
            place_id: token.place_id,
            status: TokenStatus::Pending,
            ttl_sec: token.ttl_sec,
            created_at: token.created_at,
            used_at: None,
            used_by: None,
            fail_reason: None,
            distance_m: None,
        })
    }

    async fn find_token(&self, code_hash: &CodeHash) -> StorageResult<Option<QrTokenRecord>> {
        let maybe = qr_tokens::Entity::find_by_id(code_hash.as_str().to_owned())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        maybe.map(token_to_record).transpose()
    }

    async fn begin_processing(
        &self,
        code_hash: &CodeHash,
    ) -> StorageResult<Option<QrTokenRecord>> {
        let mut query = Query::update();
        query.table(qr_tokens::Entity);
        query.value(
            qr_tokens::Column::Status,
            TokenStatusDb::Processing.to_value(),
        );
        query.and_where(qr_tokens::Column::CodeHash.eq(code_hash.as_str()));
        query.and_where(qr_tokens::Column::Status.eq(TokenStatusDb::Pending));

        let updated: Option<qr_tokens::Model> =
            update_returning_one(self.connection(), query).await?;
        updated.map(token_to_record).transpose()
    }

    async fn expire_token(&self, code_hash: &CodeHash) -> StorageResult<Option<QrTokenRecord>> {
        let mut query = Query::update();
        query.table(qr_tokens::Entity);
        query.value(qr_tokens::Column::Status, TokenStatusDb::Expired.to_value());
        query.and_where(qr_tokens::Column::CodeHash.eq(code_hash.as_str()));
        query.and_where(qr_tokens::Column::Status.eq(TokenStatusDb::Pending));

        let updated: Option<qr_tokens::Model> =
            update_returning_one(self.connection(), query).await?;
        updated.map(token_to_record).transpose()
    }

    async fn complete_success(
        &self,
        code_hash: &CodeHash,
        used_by: &UserId,
        used_at: DateTime<Utc>,
        distance_m: i32,
    ) -> StorageResult<Option<QrTokenRecord>> {
        let mut query = Query::update();
        query.table(qr_tokens::Entity);
        query.value(qr_tokens::Column::Status, TokenStatusDb::Success.to_value());
        query.value(qr_tokens::Column::UsedBy, used_by.as_str());
        query.value(qr_tokens::Column::UsedAt, used_at);
        query.value(qr_tokens::Column::DistanceM, distance_m);
        query.and_where(qr_tokens::Column::CodeHash.eq(code_hash.as_str()));
        query.and_where(qr_tokens::Column::Status.eq(TokenStatusDb::Processing));

        let updated: Option<qr_tokens::Model> =
            update_returning_one(self.connection(), query).await?;
        updated.map(token_to_record).transpose()
    }

    async fn complete_failed(
        &self,
        code_hash: &CodeHash,
        reason: &str,
        distance_m: Option<i32>,
    ) -> StorageResult<Option<QrTokenRecord>> {
        let mut query = Query::update();
        query.table(qr_tokens::Entity);
        query.value(qr_tokens::Column::Status, TokenStatusDb::Failed.to_value());
        query.value(qr_tokens::Column::FailReason, reason);
        if let Some(distance) = distance_m {
            query.value(qr_tokens::Column::DistanceM, distance);
        }
        query.and_where(qr_tokens::Column::CodeHash.eq(code_hash.as_str()));
        query.and_where(qr_tokens::Column::Status.eq(TokenStatusDb::Processing));

        let updated: Option<qr_tokens::Model> =
            update_returning_one(self.connection(), query).await?;
        updated.map(token_to_record).transpose()
    }

    async fn expire_stuck(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let result = qr_tokens::Entity::update_many()
            .col_expr(
                qr_tokens::Column::Status,
                Expr::value(TokenStatusDb::Expired.to_value()),
            )
            .filter(
                qr_tokens::Column::Status
                    .is_in([TokenStatusDb::Pending, TokenStatusDb::Processing]),
            )
            .filter(qr_tokens::Column::CreatedAt.lt(cutoff))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }
}

fn token_to_record(model: qr_tokens::Model) -> StorageResult<QrTokenRecord> {
    let code_hash = CodeHash::parse(&model.code_hash).map_err(StorageError::from_source)?;
    Ok(QrTokenRecord {
        code_hash,
        place_id: PlaceId::new(model.place_id),
        status: match model.status {
            TokenStatusDb::Pending => TokenStatus::Pending,
            TokenStatusDb::Processing => TokenStatus::Processing,
            TokenStatusDb::Success => TokenStatus::Success,
            TokenStatusDb::Expired => TokenStatus::Expired,
            TokenStatusDb::Failed => TokenStatus::Failed,
        },
        ttl_sec: model.ttl_sec,
        created_at: model.created_at,
        used_at: model.used_at,
        used_by: model.used_by.map(UserId::new),
        fail_reason: model.fail_reason,
        distance_m: model.distance_m,
    })
}
