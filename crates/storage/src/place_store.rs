use sea_orm::sea_query::OnConflict;
use sea_orm::{EntityTrait, Set};
use visitproof_domain::model::{Geohash, MissionId, PlaceId, PlaceRecord};
use visitproof_domain::storage::{PlaceStore, StorageError, StorageResult};

use crate::entity::places;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl PlaceStore for SeaOrmStorage {
    async fn upsert_place(&self, place: PlaceRecord) -> StorageResult<()> {
        let model = places::ActiveModel {
            place_id: Set(place.place_id.into_inner()),
            geohash: Set(place.geohash.into_inner()),
            radius_m: Set(place.radius_m),
            mission_id: Set(place.mission_id.into_inner()),
            reward_amount: Set(place.reward_amount),
        };
        places::Entity::insert(model)
            .on_conflict(
                OnConflict::column(places::Column::PlaceId)
                    .update_columns([
                        places::Column::Geohash,
                        places::Column::RadiusM,
                        places::Column::MissionId,
                        places::Column::RewardAmount,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn find_place(&self, place_id: &PlaceId) -> StorageResult<Option<PlaceRecord>> {
        let maybe = places::Entity::find_by_id(place_id.as_str().to_owned())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        maybe.map(place_to_record).transpose()
    }
}

fn place_to_record(model: places::Model) -> StorageResult<PlaceRecord> {
    let geohash = Geohash::parse(&model.geohash).map_err(StorageError::from_source)?;
    Ok(PlaceRecord {
        place_id: PlaceId::new(model.place_id),
        geohash,
        radius_m: model.radius_m,
        mission_id: MissionId::new(model.mission_id),
        reward_amount: model.reward_amount,
    })
}
