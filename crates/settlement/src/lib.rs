//! Library entrypoint for embedding the settlement worker inside other
//! binaries (e.g., the API process). The binary in `main.rs` remains
//! available for development/CI use but production deployments may prefer
//! in-process co-location with the API.

pub mod pipeline;
pub mod reconcile;
pub mod sink;
pub mod worker;

pub use reconcile::{run_reconcile_pass, ReconcileReport};
pub use sink::{HttpRewardSink, RewardSink, SinkError};
pub use worker::{run_settlement, SettlementError};
