use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use visitproof_domain::model::{
    generate_qr_code, hash_qr_code, Geohash, MissionId, NewQrToken, PlaceId, PlaceRecord,
};
use visitproof_domain::storage::{PlaceStore, TokenStore};

use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Deserialize, Serialize)]
pub struct UpsertPlaceBody {
    pub place_id: String,
    pub geohash: String,
    pub radius_m: i32,
    pub mission_id: String,
    pub reward_amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlaceResponse {
    pub place_id: String,
    pub geohash: String,
    pub radius_m: i32,
    pub mission_id: String,
    pub reward_amount: i64,
}

pub async fn upsert_place_handler(
    state: web::Data<AppState>,
    payload: web::Json<UpsertPlaceBody>,
) -> Result<HttpResponse, ApiError> {
    let record = PlaceRecord {
        place_id: PlaceId::parse(&payload.place_id)?,
        geohash: Geohash::parse(&payload.geohash)?,
        radius_m: payload.radius_m,
        mission_id: MissionId::parse(&payload.mission_id)?,
        reward_amount: payload.reward_amount,
    };
    state.storage().upsert_place(record.clone()).await?;
    counter!("place_upserts_total", 1);

    Ok(HttpResponse::Ok().json(PlaceResponse {
        place_id: record.place_id.into_inner(),
        geohash: record.geohash.into_inner(),
        radius_m: record.radius_m,
        mission_id: record.mission_id.into_inner(),
        reward_amount: record.reward_amount,
    }))
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct IssueTokenBody {
    pub ttl_sec: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IssueTokenResponse {
    /// The clear code leaves the service exactly once, in this response;
    /// storage only ever sees its hash.
    pub code: String,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn issue_token_handler(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<IssueTokenBody>,
) -> Result<HttpResponse, ApiError> {
    let place_id = PlaceId::parse(&path.into_inner())?;
    if state.storage().find_place(&place_id).await?.is_none() {
        return Err(ApiError::NotFound);
    }

    let code = generate_qr_code();
    let code_hash = hash_qr_code(&code);
    let ttl_sec = payload.ttl_sec.unwrap_or(state.default_token_ttl_sec());

    let record = state
        .storage()
        .insert_token(NewQrToken {
            code_hash,
            place_id,
            ttl_sec,
            created_at: Utc::now(),
        })
        .await?;
    counter!("qr_tokens_issued_total", 1);

    Ok(HttpResponse::Ok().json(IssueTokenResponse {
        code,
        expires_at: record.expires_at(),
        code_hash: record.code_hash.into_inner(),
    }))
}
