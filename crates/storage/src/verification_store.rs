use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{EntityTrait, Set};
use visitproof_domain::model::{
    Geohash, GpsMetadata, PlaceId, UserId, VerificationRecord,
};
use visitproof_domain::storage::{StorageError, StorageResult, VerificationStore};

use crate::entity::verifications;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl VerificationStore for SeaOrmStorage {
    async fn mark_gps_ok(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        metadata: GpsMetadata,
    ) -> StorageResult<()> {
        let model = verifications::ActiveModel {
            user_id: Set(user_id.as_str().to_owned()),
            place_id: Set(place_id.as_str().to_owned()),
            gps_ok: Set(true),
            gps_geohash: Set(Some(metadata.geohash.into_inner())),
            gps_distance_m: Set(Some(metadata.distance_m)),
            gps_accuracy_m: Set(metadata.accuracy_m),
            gps_checked_at: Set(Some(metadata.checked_at)),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        verifications::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    verifications::Column::UserId,
                    verifications::Column::PlaceId,
                ])
                .update_columns([
                    verifications::Column::GpsOk,
                    verifications::Column::GpsGeohash,
                    verifications::Column::GpsDistanceM,
                    verifications::Column::GpsAccuracyM,
                    verifications::Column::GpsCheckedAt,
                    verifications::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn mark_qr_ok(&self, user_id: &UserId, place_id: &PlaceId) -> StorageResult<()> {
        mark_flag(self, user_id, place_id, Flag::Qr).await
    }

    async fn mark_receipt_ok(&self, user_id: &UserId, place_id: &PlaceId) -> StorageResult<()> {
        mark_flag(self, user_id, place_id, Flag::Receipt).await
    }

    async fn find_verification(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
    ) -> StorageResult<Option<VerificationRecord>> {
        let maybe = verifications::Entity::find_by_id((
            user_id.as_str().to_owned(),
            place_id.as_str().to_owned(),
        ))
        .one(self.connection())
        .await
        .map_err(StorageError::from_source)?;
        maybe.map(verification_to_record).transpose()
    }
}

enum Flag {
    Qr,
    Receipt,
}

async fn mark_flag(
    storage: &SeaOrmStorage,
    user_id: &UserId,
    place_id: &PlaceId,
    flag: Flag,
) -> StorageResult<()> {
    let mut model = verifications::ActiveModel {
        user_id: Set(user_id.as_str().to_owned()),
        place_id: Set(place_id.as_str().to_owned()),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };
    let flag_column = match flag {
        Flag::Qr => {
            model.qr_ok = Set(true);
            verifications::Column::QrOk
        }
        Flag::Receipt => {
            model.receipt_ok = Set(true);
            verifications::Column::ReceiptOk
        }
    };
    verifications::Entity::insert(model)
        .on_conflict(
            OnConflict::columns([
                verifications::Column::UserId,
                verifications::Column::PlaceId,
            ])
            .update_columns([flag_column, verifications::Column::UpdatedAt])
            .to_owned(),
        )
        .exec_without_returning(storage.connection())
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}

fn verification_to_record(model: verifications::Model) -> StorageResult<VerificationRecord> {
    let gps_metadata = match (model.gps_geohash, model.gps_distance_m, model.gps_checked_at) {
        (Some(geohash), Some(distance_m), Some(checked_at)) => Some(GpsMetadata {
            geohash: Geohash::parse(&geohash).map_err(StorageError::from_source)?,
            distance_m,
            accuracy_m: model.gps_accuracy_m,
            checked_at,
        }),
        _ => None,
    };

    Ok(VerificationRecord {
        user_id: UserId::new(model.user_id),
        place_id: PlaceId::new(model.place_id),
        gps_ok: model.gps_ok,
        qr_ok: model.qr_ok,
        receipt_ok: model.receipt_ok,
        gps_metadata,
        updated_at: model.updated_at,
    })
}
