use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{ActiveEnum, ColumnTrait, EntityTrait, QueryFilter, Set};
use visitproof_domain::model::{MediaUrl, OcrStatus, PlaceId, ReceiptRecord, UserId};
use visitproof_domain::storage::{OcrOutcome, ReceiptStore, StorageError, StorageResult};

use crate::entity::receipts::{self, OcrStatusDb};
use crate::{update_returning_one, SeaOrmStorage};

#[async_trait::async_trait]
impl ReceiptStore for SeaOrmStorage {
    async fn find_receipt(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        media_url: &MediaUrl,
    ) -> StorageResult<Option<ReceiptRecord>> {
        let maybe = receipts::Entity::find_by_id((
            user_id.as_str().to_owned(),
            place_id.as_str().to_owned(),
            media_url.as_str().to_owned(),
        ))
        .one(self.connection())
        .await
        .map_err(StorageError::from_source)?;
        maybe.map(receipt_to_record).transpose()
    }

    async fn begin_ocr(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        media_url: &MediaUrl,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ReceiptRecord>> {
        let model = receipts::ActiveModel {
            user_id: Set(user_id.as_str().to_owned()),
            place_id: Set(place_id.as_str().to_owned()),
            media_url: Set(media_url.as_str().to_owned()),
            ocr_status: Set(OcrStatusDb::Pending),
            validation_errors: Set(serde_json::json!([])),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        receipts::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    receipts::Column::UserId,
                    receipts::Column::PlaceId,
                    receipts::Column::MediaUrl,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;

        let mut query = Query::update();
        query.table(receipts::Entity);
        query.value(
            receipts::Column::OcrStatus,
            OcrStatusDb::Processing.to_value(),
        );
        query.value(receipts::Column::UpdatedAt, now);
        query.and_where(receipts::Column::UserId.eq(user_id.as_str()));
        query.and_where(receipts::Column::PlaceId.eq(place_id.as_str()));
        query.and_where(receipts::Column::MediaUrl.eq(media_url.as_str()));
        query.and_where(receipts::Column::OcrStatus.eq(OcrStatusDb::Pending));

        let updated: Option<receipts::Model> =
            update_returning_one(self.connection(), query).await?;
        updated.map(receipt_to_record).transpose()
    }

    async fn complete_ocr(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        media_url: &MediaUrl,
        outcome: OcrOutcome,
    ) -> StorageResult<Option<ReceiptRecord>> {
        let status = if outcome.completed {
            OcrStatusDb::Completed
        } else {
            OcrStatusDb::Failed
        };
        let ocr_data = outcome
            .ocr_data
            .map(|data| serde_json::to_value(data).map_err(StorageError::from_source))
            .transpose()?;
        let validation_errors =
            serde_json::to_value(&outcome.validation_errors).map_err(StorageError::from_source)?;

        let mut query = Query::update();
        query.table(receipts::Entity);
        query.value(receipts::Column::OcrStatus, status.to_value());
        query.value(receipts::Column::OcrData, ocr_data);
        query.value(receipts::Column::ValidationErrors, validation_errors);
        query.value(receipts::Column::Total, outcome.total);
        query.value(receipts::Column::PaidAt, outcome.paid_at);
        query.value(receipts::Column::UpdatedAt, Utc::now());
        query.and_where(receipts::Column::UserId.eq(user_id.as_str()));
        query.and_where(receipts::Column::PlaceId.eq(place_id.as_str()));
        query.and_where(receipts::Column::MediaUrl.eq(media_url.as_str()));
        query.and_where(receipts::Column::OcrStatus.eq(OcrStatusDb::Processing));

        let updated: Option<receipts::Model> =
            update_returning_one(self.connection(), query).await?;
        updated.map(receipt_to_record).transpose()
    }

    async fn fail_stuck(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let result = receipts::Entity::update_many()
            .col_expr(
                receipts::Column::OcrStatus,
                Expr::value(OcrStatusDb::Failed.to_value()),
            )
            .col_expr(
                receipts::Column::ValidationErrors,
                Expr::value(serde_json::json!(["reconciled"])),
            )
            .filter(
                receipts::Column::OcrStatus
                    .is_in([OcrStatusDb::Pending, OcrStatusDb::Processing]),
            )
            .filter(receipts::Column::CreatedAt.lt(cutoff))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }
}

fn receipt_to_record(model: receipts::Model) -> StorageResult<ReceiptRecord> {
    let ocr_data = model
        .ocr_data
        .map(|value| serde_json::from_value(value).map_err(StorageError::from_source))
        .transpose()?;
    let validation_errors = serde_json::from_value(model.validation_errors)
        .map_err(StorageError::from_source)?;

    Ok(ReceiptRecord {
        user_id: UserId::new(model.user_id),
        place_id: PlaceId::new(model.place_id),
        media_url: MediaUrl::new(model.media_url),
        ocr_status: match model.ocr_status {
            OcrStatusDb::Pending => OcrStatus::Pending,
            OcrStatusDb::Processing => OcrStatus::Processing,
            OcrStatusDb::Completed => OcrStatus::Completed,
            OcrStatusDb::Failed => OcrStatus::Failed,
        },
        ocr_data,
        validation_errors,
        total: model.total,
        paid_at: model.paid_at,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}
