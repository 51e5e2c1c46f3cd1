use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{
    ActiveEnum, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use visitproof_domain::model::{SettlementJobRecord, SettlementPayload, SettlementStatus};
use visitproof_domain::storage::{SettlementStore, StorageError, StorageResult};

use crate::entity::settlement_jobs::{self, SettlementStatusDb};
use crate::{update_returning_one, SeaOrmStorage};

#[async_trait::async_trait]
impl SettlementStore for SeaOrmStorage {
    async fn enqueue(
        &self,
        idempotency_key: &str,
        payload: &SettlementPayload,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let payload = serde_json::to_value(payload).map_err(StorageError::from_source)?;
        let model = settlement_jobs::ActiveModel {
            idempotency_key: Set(idempotency_key.to_owned()),
            payload: Set(payload),
            status: Set(SettlementStatusDb::Queued),
            retry_count: Set(0),
            next_attempt_at: Set(now),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        let inserted = settlement_jobs::Entity::insert(model)
            .on_conflict(
                OnConflict::column(settlement_jobs::Column::IdempotencyKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(inserted == 1)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> StorageResult<Vec<SettlementJobRecord>> {
        let candidates: Vec<String> = settlement_jobs::Entity::find()
            .select_only()
            .column(settlement_jobs::Column::IdempotencyKey)
            .filter(settlement_jobs::Column::Status.eq(SettlementStatusDb::Queued))
            .filter(settlement_jobs::Column::NextAttemptAt.lte(now))
            .order_by_asc(settlement_jobs::Column::CreatedAt)
            .limit(limit)
            .into_tuple()
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for key in candidates {
            let mut query = Query::update();
            query.table(settlement_jobs::Entity);
            query.value(
                settlement_jobs::Column::Status,
                SettlementStatusDb::InFlight.to_value(),
            );
            query.value(settlement_jobs::Column::UpdatedAt, now);
            query.and_where(settlement_jobs::Column::IdempotencyKey.eq(key.as_str()));
            query.and_where(settlement_jobs::Column::Status.eq(SettlementStatusDb::Queued));

            let won: Option<settlement_jobs::Model> =
                update_returning_one(self.connection(), query).await?;
            if let Some(model) = won {
                claimed.push(job_to_record(model)?);
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, idempotency_key: &str) -> StorageResult<()> {
        settlement_jobs::Entity::update_many()
            .col_expr(
                settlement_jobs::Column::Status,
                Expr::value(SettlementStatusDb::Done.to_value()),
            )
            .col_expr(settlement_jobs::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(settlement_jobs::Column::IdempotencyKey.eq(idempotency_key))
            .filter(settlement_jobs::Column::Status.eq(SettlementStatusDb::InFlight))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        idempotency_key: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        settlement_jobs::Entity::update_many()
            .col_expr(
                settlement_jobs::Column::Status,
                Expr::value(SettlementStatusDb::Queued.to_value()),
            )
            .col_expr(
                settlement_jobs::Column::RetryCount,
                Expr::col(settlement_jobs::Column::RetryCount).add(1),
            )
            .col_expr(settlement_jobs::Column::LastError, Expr::value(error))
            .col_expr(
                settlement_jobs::Column::NextAttemptAt,
                Expr::value(next_attempt_at),
            )
            .col_expr(settlement_jobs::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(settlement_jobs::Column::IdempotencyKey.eq(idempotency_key))
            .filter(settlement_jobs::Column::Status.eq(SettlementStatusDb::InFlight))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn mark_dead(&self, idempotency_key: &str, error: &str) -> StorageResult<()> {
        settlement_jobs::Entity::update_many()
            .col_expr(
                settlement_jobs::Column::Status,
                Expr::value(SettlementStatusDb::DeadLettered.to_value()),
            )
            .col_expr(settlement_jobs::Column::LastError, Expr::value(error))
            .col_expr(settlement_jobs::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(settlement_jobs::Column::IdempotencyKey.eq(idempotency_key))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn find_job(
        &self,
        idempotency_key: &str,
    ) -> StorageResult<Option<SettlementJobRecord>> {
        let maybe = settlement_jobs::Entity::find_by_id(idempotency_key.to_owned())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        maybe.map(job_to_record).transpose()
    }

    async fn requeue_stuck(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let result = settlement_jobs::Entity::update_many()
            .col_expr(
                settlement_jobs::Column::Status,
                Expr::value(SettlementStatusDb::Queued.to_value()),
            )
            .col_expr(settlement_jobs::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(settlement_jobs::Column::Status.eq(SettlementStatusDb::InFlight))
            .filter(settlement_jobs::Column::UpdatedAt.lt(cutoff))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }
}

fn job_to_record(model: settlement_jobs::Model) -> StorageResult<SettlementJobRecord> {
    let payload = serde_json::from_value(model.payload).map_err(StorageError::from_source)?;
    Ok(SettlementJobRecord {
        idempotency_key: model.idempotency_key,
        payload,
        status: match model.status {
            SettlementStatusDb::Queued => SettlementStatus::Queued,
            SettlementStatusDb::InFlight => SettlementStatus::InFlight,
            SettlementStatusDb::Done => SettlementStatus::Done,
            SettlementStatusDb::DeadLettered => SettlementStatus::DeadLettered,
        },
        retry_count: model.retry_count,
        next_attempt_at: model.next_attempt_at,
        last_error: model.last_error,
        created_at: model.created_at,
    })
}
