use actix_web::{web, HttpResponse};
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

use visitproof_domain::geo::check_geofence;
use visitproof_domain::model::{Geohash, GpsMetadata, PlaceId, UserId};
use visitproof_domain::policy;
use visitproof_domain::ratelimit::RateLimitStatus;
use visitproof_domain::storage::{PlaceStore, VerificationStore};

use crate::state::AppState;

use super::{enforce_rate_limit, ApiError};

const ENDPOINT: &str = "verify_location";

#[derive(Debug, Deserialize, Serialize)]
pub struct LocationVerifyBody {
    pub user_id: String,
    pub place_id: String,
    pub user_geohash: String,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
enum GeofenceOutcome {
    Within,
    Outside,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationVerifyResponse {
    pub gps_ok: bool,
    pub distance_m: i32,
    pub rate_limit: RateLimitStatus,
}

/// Location checks carry only a geohash cell, never raw coordinates, and
/// only the positive outcome is recorded; a miss leaves the stored flags
/// untouched so the user can move closer and retry.
pub async fn verify_location_handler(
    state: web::Data<AppState>,
    payload: web::Json<LocationVerifyBody>,
) -> Result<HttpResponse, ApiError> {
    let user_id = UserId::parse(&payload.user_id)?;
    let place_id = PlaceId::parse(&payload.place_id)?;
    let user_geohash = Geohash::parse(&payload.user_geohash)?;

    let rate_limit = enforce_rate_limit(&state, ENDPOINT, user_id.as_str()).await?;

    let place = state
        .storage()
        .find_place(&place_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let check = check_geofence(
        &place.geohash,
        &user_geohash,
        f64::from(place.radius_m),
        payload.accuracy_m,
        state.geofence(),
    )?;
    let distance_m = check.distance_m.round() as i32;

    let outcome = if check.within_radius {
        GeofenceOutcome::Within
    } else {
        GeofenceOutcome::Outside
    };
    counter!("location_checks_total", 1, "result" => outcome.as_ref().to_owned());

    if check.within_radius {
        let now = Utc::now();
        state
            .storage()
            .mark_gps_ok(
                &user_id,
                &place_id,
                GpsMetadata {
                    geohash: user_geohash,
                    distance_m,
                    accuracy_m: payload.accuracy_m,
                    checked_at: now,
                },
            )
            .await?;
        policy::evaluate(state.storage(), &user_id, &place_id, now).await?;
    }

    Ok(HttpResponse::Ok().json(LocationVerifyResponse {
        gps_ok: check.within_radius,
        distance_m,
        rate_limit,
    }))
}
