pub mod location;
pub mod metrics;
pub mod place;
pub mod policy;
pub mod qr;
pub mod receipt;

pub use location::verify_location_handler;
pub use metrics::metrics_handler;
pub use place::{issue_token_handler, upsert_place_handler};
pub use policy::verification_status_handler;
pub use qr::verify_qr_handler;
pub use receipt::verify_receipt_handler;

use actix_web::{http::StatusCode, HttpRequest, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use visitproof_domain::geo::GeoError;
use visitproof_domain::model::FieldFormatError;
use visitproof_domain::qr::QrVerifyError;
use visitproof_domain::ratelimit::{RateDecision, RateLimitStatus};
use visitproof_domain::storage::StorageError;

use crate::state::AppState;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid field: {0}")]
    InvalidField(#[from] FieldFormatError),
    #[error("missing Idempotency-Key header")]
    MissingIdempotencyKey,
    #[error("not found")]
    NotFound,
    #[error("rate limit exceeded")]
    RateLimited(RateLimitStatus),
    #[error("geo error: {0}")]
    Geo(#[from] GeoError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl From<QrVerifyError> for ApiError {
    fn from(value: QrVerifyError) -> Self {
        match value {
            QrVerifyError::Storage(err) => Self::Storage(err),
            QrVerifyError::Geo(err) => Self::Geo(err),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidField(_) | ApiError::MissingIdempotencyKey => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Geo(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            ApiError::RateLimited(status) => HttpResponse::TooManyRequests()
                .insert_header(("Retry-After", status.reset_seconds.to_string()))
                .json(RateLimitedBody {
                    error: self.to_string(),
                    rate_limit: *status,
                }),
            _ => HttpResponse::build(self.status_code()).json(ErrorBody {
                error: self.to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct RateLimitedBody {
    pub error: String,
    pub rate_limit: RateLimitStatus,
}

/// Counts the request against the endpoint's fixed window and rejects it
/// once the window is over budget.
pub(crate) async fn enforce_rate_limit(
    state: &AppState,
    endpoint: &str,
    identity: &str,
) -> Result<RateLimitStatus, ApiError> {
    match state
        .rate_limiter()
        .check(endpoint, identity, chrono::Utc::now())
        .await
    {
        RateDecision::Allowed(status) => Ok(status),
        RateDecision::Limited(status) => Err(ApiError::RateLimited(status)),
    }
}

/// The `Idempotency-Key` header is required on mutating verification calls.
/// The key is scoped per endpoint so the same client key cannot splice
/// responses across operations.
pub(crate) fn idempotency_key(request: &HttpRequest, endpoint: &str) -> Result<String, ApiError> {
    let value = request
        .headers()
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::MissingIdempotencyKey)?;
    Ok(format!("{endpoint}:{value}"))
}
