//! Data structures and derivation helpers shared across the API and
//! settlement binaries.

use chrono::{DateTime, Duration, Utc};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use strum_macros::AsRefStr;
use thiserror::Error;

/// Length (in hex characters) of a SHA3-256 digest, the canonical form for
/// code hashes and settlement keys.
pub const HASH_LENGTH: usize = 64;

/// Geohash lengths accepted anywhere in the system. Raw coordinates are
/// never persisted or transmitted; these strings are the only location
/// granularity that crosses a boundary.
pub const GEOHASH_MIN_LENGTH: usize = 5;
pub const GEOHASH_MAX_LENGTH: usize = 6;

const GEOHASH_ALPHABET: &str = "0123456789bcdefghjkmnpqrstuvwxyz";

/// Errors emitted when user-supplied identifiers fail validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldFormatError {
    #[error("geohash must be {GEOHASH_MIN_LENGTH}-{GEOHASH_MAX_LENGTH} characters")]
    GeohashLength,
    #[error("geohash contains characters outside the base32 alphabet")]
    GeohashAlphabet,
    #[error("identifier must be non-empty and at most {0} characters")]
    IdentifierLength(usize),
    #[error("code hash must be exactly {HASH_LENGTH} hex characters")]
    CodeHashFormat,
}

const MAX_IDENTIFIER_LENGTH: usize = 128;

fn validate_identifier(value: &str) -> Result<(), FieldFormatError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_IDENTIFIER_LENGTH {
        return Err(FieldFormatError::IdentifierLength(MAX_IDENTIFIER_LENGTH));
    }
    Ok(())
}

macro_rules! identifier_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(value: &str) -> Result<Self, FieldFormatError> {
                validate_identifier(value)?;
                Ok(Self(value.trim().to_string()))
            }

            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }
    };
}

identifier_newtype!(
    /// Opaque caller-side user identifier.
    UserId
);
identifier_newtype!(
    /// Identifier of a registered physical place.
    PlaceId
);
identifier_newtype!(
    /// Identifier of the mission/campaign a reward belongs to.
    MissionId
);
identifier_newtype!(
    /// Content reference for an uploaded receipt image. The dedup key for
    /// OCR: one media URL converges to exactly one terminal OCR result.
    MediaUrl
);

/// Validated geohash string, 5 or 6 characters of the base32 alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Geohash(String);

impl Geohash {
    pub fn parse(value: &str) -> Result<Self, FieldFormatError> {
        let trimmed = value.trim().to_ascii_lowercase();
        if !(GEOHASH_MIN_LENGTH..=GEOHASH_MAX_LENGTH).contains(&trimmed.len()) {
            return Err(FieldFormatError::GeohashLength);
        }
        if !trimmed.chars().all(|c| GEOHASH_ALPHABET.contains(c)) {
            return Err(FieldFormatError::GeohashAlphabet);
        }
        Ok(Self(trimmed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// One-way hash of a printed or rotating QR code. Only the hash is ever
/// stored; the clear code is returned once at issuance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeHash(String);

impl CodeHash {
    pub fn parse(value: &str) -> Result<Self, FieldFormatError> {
        let trimmed = value.trim();
        if trimmed.len() != HASH_LENGTH || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FieldFormatError::CodeHashFormat);
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Derives the stored hash for a clear QR code.
pub fn hash_qr_code(code: &str) -> CodeHash {
    let mut hasher = Sha3_256::new();
    hasher.update(code.as_bytes());
    CodeHash::new(hex_encode(hasher.finalize()))
}

/// Hashes a caller identity (e.g. client IP) before it is used as a
/// rate-limit key. Clear identities are never stored or logged.
pub fn hash_identity(identity: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(identity.as_bytes());
    hex_encode(hasher.finalize())
}

/// Deterministically derives the settlement idempotency key. The same
/// (user, place, mission, amount) tuple always maps to the same key, which
/// is what guarantees at-most-one payout.
pub fn derive_settlement_key(
    user: &UserId,
    place: &PlaceId,
    mission: &MissionId,
    amount: i64,
) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(user.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(place.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(mission.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(amount.to_be_bytes());
    hex_encode(hasher.finalize())
}

/// Generates a fresh clear QR code. 32 random bytes, hex-encoded; the
/// caller stores only `hash_qr_code` of it.
pub fn generate_qr_code() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(bytes)
}

/// Lifecycle of a QR token. Once the status leaves `Pending` it is
/// monotonic; `Success`, `Expired` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TokenStatus {
    Pending,
    Processing,
    Success,
    Expired,
    Failed,
}

impl TokenStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Expired | Self::Failed)
    }
}

/// Lifecycle of a receipt OCR pass. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OcrStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OcrStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Lifecycle of a settlement job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SettlementStatus {
    Queued,
    InFlight,
    Done,
    DeadLettered,
}

/// A registered physical place: the geofence centre, radius and the reward
/// released on a fully verified visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceRecord {
    pub place_id: PlaceId,
    pub geohash: Geohash,
    pub radius_m: i32,
    pub mission_id: MissionId,
    pub reward_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrTokenRecord {
    pub code_hash: CodeHash,
    pub place_id: PlaceId,
    pub status: TokenStatus,
    pub ttl_sec: i64,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<UserId>,
    pub fail_reason: Option<String>,
    pub distance_m: Option<i32>,
}

impl QrTokenRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_sec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQrToken {
    pub code_hash: CodeHash,
    pub place_id: PlaceId,
    pub ttl_sec: i64,
    pub created_at: DateTime<Utc>,
}

/// Structured output of the external OCR capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrData {
    pub total: Option<i64>,
    #[serde(default)]
    pub items: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub merchant_name: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptRecord {
    pub user_id: UserId,
    pub place_id: PlaceId,
    pub media_url: MediaUrl,
    pub ocr_status: OcrStatus,
    pub ocr_data: Option<OcrData>,
    pub validation_errors: Vec<String>,
    pub total: Option<i64>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// GPS evidence kept alongside a verification. Geohash-level only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsMetadata {
    pub geohash: Geohash,
    pub distance_m: i32,
    pub accuracy_m: Option<f64>,
    pub checked_at: DateTime<Utc>,
}

/// The three independent proof booleans for one `(user, place)` pair. Each
/// is set only by its owning verifier and is monotonic true.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRecord {
    pub user_id: UserId,
    pub place_id: PlaceId,
    pub gps_ok: bool,
    pub qr_ok: bool,
    pub receipt_ok: bool,
    pub gps_metadata: Option<GpsMetadata>,
    pub updated_at: DateTime<Utc>,
}

/// Payload carried by a settlement job; everything the reward sink needs to
/// replay a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementPayload {
    pub user_id: UserId,
    pub place_id: PlaceId,
    pub mission_id: MissionId,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementJobRecord {
    pub idempotency_key: String,
    pub payload: SettlementPayload,
    pub status: SettlementStatus,
    pub retry_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
