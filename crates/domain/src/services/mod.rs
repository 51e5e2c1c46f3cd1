//! Cross-cutting runtime services (telemetry, in-memory caching) shared by
//! the API and settlement binaries.

pub mod cache;
pub mod telemetry;
