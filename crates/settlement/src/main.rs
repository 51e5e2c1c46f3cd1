//! Settlement worker binary that delivers queued reward jobs and sweeps
//! stuck verification state.

mod pipeline;
mod reconcile;
mod sink;
mod worker;

use std::io;

use visitproof_domain::config::SettlementConfig;
use visitproof_domain::services::telemetry::{init_telemetry, TelemetryConfig};
use visitproof_storage::SeaOrmStorage;

use sink::HttpRewardSink;
use worker::{run_settlement, SettlementError};

#[tokio::main]
async fn main() -> io::Result<()> {
    if let Err(err) = bootstrap().await {
        eprintln!("[settlement] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap() -> Result<(), SettlementError> {
    let config = SettlementConfig::load_from_env()?;
    let telemetry_config = TelemetryConfig::from_env("SETTLEMENT");
    init_telemetry(&telemetry_config)?;
    let storage = SeaOrmStorage::connect(config.database_url()).await?;
    let sink = HttpRewardSink::new(config.reward_endpoint());
    run_settlement(config, storage, sink).await
}
