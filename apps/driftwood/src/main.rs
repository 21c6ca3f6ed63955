use anyhow::Result;
use clap::Parser;
use driftwood_client::{
    config::{Cli, ClientConfig},
    terminal,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so the conversation on stdout stays readable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();

    let config = ClientConfig::try_from(Cli::parse())?;
    terminal::run(config).await
}
