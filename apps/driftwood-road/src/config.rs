use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub liveness_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            liveness_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "driftwood-road",
    author,
    version,
    about = "Pairs strangers by mode and relays their chat and signaling traffic"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(
        long,
        env = "DRIFTWOOD_ROAD_LISTEN_ADDR",
        default_value = "0.0.0.0:3000"
    )]
    pub listen_addr: String,

    /// Overrides the port of the listen address.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Seconds between liveness pings. Connections silent for two pings are evicted.
    #[arg(
        long,
        env = "DRIFTWOOD_ROAD_LIVENESS_INTERVAL_SECS",
        default_value_t = 30
    )]
    pub liveness_interval_secs: u64,

    /// Seconds open websockets get to close once shutdown begins.
    #[arg(long, env = "DRIFTWOOD_ROAD_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let mut listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if let Some(port) = cli.port {
            listen_addr.set_port(port);
        }
        if cli.liveness_interval_secs == 0 {
            bail!("liveness interval must be greater than zero");
        }
        Ok(ServerConfig {
            listen_addr,
            liveness_interval: Duration::from_secs(cli.liveness_interval_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
