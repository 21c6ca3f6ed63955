use anyhow::{Context, Result};
use driftwood_proto::{Mode, ServerMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::{
    config::ClientConfig,
    session::Negotiation,
    signaling::{SignalingClient, SignalingEvent},
    webrtc_engine::WebRtcEngine,
};

pub const LOOKING: &str = "Looking for a stranger...";
pub const CONNECTED: &str = "Connected with a stranger!";
pub const PARTNER_LEFT: &str = "Stranger disconnected.";
pub const NOT_PAIRED: &str = "You are not connected to anyone yet.";
pub const RECONNECTING: &str = "Lost the server, reconnecting...";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Say(String),
    Skip,
    Quit,
    Nothing,
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        match line.trim() {
            "" => Command::Nothing,
            "/skip" => Command::Skip,
            "/quit" | "/exit" => Command::Quit,
            _ => Command::Say(line.to_string()),
        }
    }
}

/// Runs the interactive client on stdin/stdout.
pub async fn run(config: ClientConfig) -> Result<()> {
    run_with_io(
        config,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Runs the client loop over arbitrary line input and text output until the
/// input ends or `/quit` is entered.
pub async fn run_with_io<R, W>(config: ClientConfig, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let SignalingClient {
        handle,
        mut events,
        task,
    } = SignalingClient::spawn(config.signaling());

    let negotiation = match config.mode {
        Mode::Video => {
            let engine = WebRtcEngine::new(config.ice_servers.clone())
                .context("failed to initialise webrtc")?;
            Some(Negotiation::spawn(engine, Mode::Video, handle.sender()))
        }
        Mode::Chat => None,
    };

    handle.join(config.mode)?;
    info!(mode = %config.mode, url = %config.signaling.url, "joining");

    let mut lines = input.lines();
    let mut paired = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read input")? else {
                    break;
                };
                match Command::parse(&line) {
                    Command::Nothing => {}
                    Command::Quit => break,
                    Command::Skip => {
                        if let Some(negotiation) = &negotiation {
                            negotiation.reset();
                        }
                        paired = false;
                        handle.leave()?;
                        handle.join(config.mode)?;
                    }
                    Command::Say(text) if paired => handle.chat(text)?,
                    Command::Say(_) => say(&mut output, NOT_PAIRED).await?,
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    SignalingEvent::Connected => debug!("signaling connected"),
                    SignalingEvent::Disconnected => {
                        if let Some(negotiation) = &negotiation {
                            negotiation.reset();
                        }
                        if paired {
                            say(&mut output, PARTNER_LEFT).await?;
                        }
                        paired = false;
                        say(&mut output, RECONNECTING).await?;
                    }
                    SignalingEvent::Message(message) => {
                        if let Some(negotiation) = &negotiation {
                            negotiation.handle_server_message(&message);
                        }
                        match message {
                            ServerMessage::Waiting => say(&mut output, LOOKING).await?,
                            ServerMessage::Paired { .. } => {
                                paired = true;
                                say(&mut output, CONNECTED).await?;
                            }
                            ServerMessage::Chat { text } => {
                                say(&mut output, &format!("Stranger: {text}")).await?;
                            }
                            ServerMessage::PartnerLeft => {
                                paired = false;
                                say(&mut output, PARTNER_LEFT).await?;
                            }
                            ServerMessage::Offer { .. }
                            | ServerMessage::Answer { .. }
                            | ServerMessage::Ice { .. } => {}
                        }
                    }
                }
            }
        }
    }

    handle.shutdown();
    if let Some(negotiation) = negotiation {
        negotiation.close().await;
    }
    let _ = task.await;
    Ok(())
}

async fn say<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_recognised() {
        assert_eq!(Command::parse("/skip"), Command::Skip);
        assert_eq!(Command::parse("  /quit \n"), Command::Quit);
        assert_eq!(Command::parse("   "), Command::Nothing);
        assert_eq!(
            Command::parse("hello there\r\n"),
            Command::Say("hello there".into())
        );
        assert_eq!(
            Command::parse("/skipping rope"),
            Command::Say("/skipping rope".into())
        );
    }
}
