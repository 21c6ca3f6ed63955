use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use driftwood_proto::Mode;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::signaling::{websocket_url, SignalingConfig};

const DEFAULT_STUN: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Parser)]
#[command(
    name = "driftwood",
    author,
    version,
    about = "Talk to a random stranger over text or video"
)]
pub struct Cli {
    /// Matchmaking server address; http(s) urls are mapped to ws(s).
    #[arg(long, env = "DRIFTWOOD_URL", default_value = "ws://127.0.0.1:3000/ws")]
    pub url: String,

    /// Pool to join: chat or video.
    #[arg(long, default_value = "chat")]
    pub mode: Mode,

    /// STUN server url; repeat for several.
    #[arg(long = "stun", default_values_t = DEFAULT_STUN.map(String::from))]
    pub stun: Vec<String>,

    /// TURN server url used as a relay fallback.
    #[arg(long)]
    pub turn: Option<String>,

    #[arg(long, requires = "turn")]
    pub turn_username: Option<String>,

    #[arg(long, requires = "turn")]
    pub turn_credential: Option<String>,

    /// Skip all ICE servers; only host candidates are gathered.
    #[arg(long, env = "DRIFTWOOD_LOCALHOST_ONLY", default_value_t = false)]
    pub localhost_only: bool,

    /// Seconds to wait before reconnecting to the server.
    #[arg(long, default_value_t = 3)]
    pub reconnect_delay_secs: u64,

    /// Stay idle after a partner leaves instead of queueing again.
    #[arg(long)]
    pub no_auto_rejoin: bool,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub mode: Mode,
    pub ice_servers: Vec<RTCIceServer>,
    pub signaling: SignalingConfig,
}

impl ClientConfig {
    pub fn signaling(&self) -> SignalingConfig {
        self.signaling.clone()
    }
}

impl TryFrom<Cli> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let url = websocket_url(&cli.url)
            .with_context(|| format!("invalid server url: {}", cli.url))?;
        if cli.reconnect_delay_secs == 0 {
            bail!("reconnect delay must be greater than zero");
        }

        let mut ice_servers = Vec::new();
        if !cli.localhost_only {
            if !cli.stun.is_empty() {
                ice_servers.push(RTCIceServer {
                    urls: cli.stun,
                    ..Default::default()
                });
            }
            if let Some(turn) = cli.turn {
                let (Some(username), Some(credential)) = (cli.turn_username, cli.turn_credential)
                else {
                    bail!("--turn requires --turn-username and --turn-credential");
                };
                ice_servers.push(RTCIceServer {
                    urls: vec![turn],
                    username,
                    credential,
                    ..Default::default()
                });
            }
        }

        Ok(ClientConfig {
            mode: cli.mode,
            ice_servers,
            signaling: SignalingConfig {
                url,
                reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
                auto_rejoin: !cli.no_auto_rejoin,
            },
        })
    }
}
