use anyhow::Result;
use clap::Parser;
use driftwood_road::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        liveness_interval_secs = config.liveness_interval.as_secs(),
        "starting driftwood-road"
    );

    driftwood_road::run(config, telemetry.metrics_handle()).await
}
