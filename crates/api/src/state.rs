use std::sync::Arc;

use visitproof_domain::geo::GeofencePolicy;
use visitproof_domain::idempotency::IdempotencyGuard;
use visitproof_domain::ratelimit::RateLimiter;
use visitproof_domain::receipt::{OcrProvider, ReceiptPolicy};
use visitproof_domain::services::telemetry::TelemetryGuard;
use visitproof_storage::SeaOrmStorage;

#[derive(Clone)]
pub struct AppState {
    storage: SeaOrmStorage,
    telemetry: TelemetryGuard,
    rate_limiter: RateLimiter<SeaOrmStorage>,
    idempotency: IdempotencyGuard<SeaOrmStorage>,
    ocr: Arc<dyn OcrProvider>,
    geofence: GeofencePolicy,
    receipt_policy: ReceiptPolicy,
    default_token_ttl_sec: i64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: SeaOrmStorage,
        telemetry: TelemetryGuard,
        rate_limiter: RateLimiter<SeaOrmStorage>,
        idempotency: IdempotencyGuard<SeaOrmStorage>,
        ocr: Arc<dyn OcrProvider>,
        geofence: GeofencePolicy,
        receipt_policy: ReceiptPolicy,
        default_token_ttl_sec: i64,
    ) -> Self {
        Self {
            storage,
            telemetry,
            rate_limiter,
            idempotency,
            ocr,
            geofence,
            receipt_policy,
            default_token_ttl_sec,
        }
    }

    pub fn storage(&self) -> &SeaOrmStorage {
        &self.storage
    }

    pub fn telemetry(&self) -> &TelemetryGuard {
        &self.telemetry
    }

    pub fn rate_limiter(&self) -> &RateLimiter<SeaOrmStorage> {
        &self.rate_limiter
    }

    pub fn idempotency(&self) -> &IdempotencyGuard<SeaOrmStorage> {
        &self.idempotency
    }

    pub fn ocr(&self) -> &dyn OcrProvider {
        self.ocr.as_ref()
    }

    pub fn geofence(&self) -> &GeofencePolicy {
        &self.geofence
    }

    pub fn receipt_policy(&self) -> &ReceiptPolicy {
        &self.receipt_policy
    }

    pub fn default_token_ttl_sec(&self) -> i64 {
        self.default_token_ttl_sec
    }
}
