//! Domain-level building blocks shared across the API and settlement
//! crates: the verification state machines, geofence math, rate limiting,
//! idempotent replay, and the storage traits the other crates implement or
//! consume.

pub mod config;
pub mod geo;
pub mod idempotency;
pub mod model;
pub mod policy;
pub mod qr;
pub mod ratelimit;
pub mod receipt;
pub mod services;
pub mod storage;
