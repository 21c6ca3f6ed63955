use driftwood_proto::{ClientMessage, ServerMessage};
use metrics::counter;
use thiserror::Error;
use tracing::debug;

use crate::matchmaking::{ConnectionId, JoinOutcome, Matchmaker, Outbound, RelayOutcome};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("binary frame is not valid utf-8")]
    NotUtf8,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl FrameError {
    fn metric_label(&self) -> &'static str {
        match self {
            FrameError::NotUtf8 => "not_utf8",
            FrameError::Malformed(_) => "malformed",
        }
    }
}

/// What happened to a single inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Joined(JoinOutcome),
    Left,
    Relayed,
    Dropped(&'static str),
}

pub fn decode(text: &str) -> Result<ClientMessage, FrameError> {
    Ok(serde_json::from_str(text)?)
}

/// Routes one text frame from `from`. Malformed frames and frames with no
/// open partner are dropped without telling the sender.
pub fn handle_text(matchmaker: &Matchmaker, from: ConnectionId, text: &str) -> Dispatch {
    match decode(text) {
        Ok(message) => dispatch(matchmaker, from, message, text),
        Err(err) => drop_frame(from, &err),
    }
}

/// Binary frames are accepted when they carry UTF-8 JSON.
pub fn handle_binary(matchmaker: &Matchmaker, from: ConnectionId, bytes: &[u8]) -> Dispatch {
    match std::str::from_utf8(bytes) {
        Ok(text) => handle_text(matchmaker, from, text),
        Err(_) => drop_frame(from, &FrameError::NotUtf8),
    }
}

fn dispatch(
    matchmaker: &Matchmaker,
    from: ConnectionId,
    message: ClientMessage,
    raw: &str,
) -> Dispatch {
    if !matchmaker.is_registered(from) {
        return Dispatch::Dropped("unregistered");
    }
    let kind = message.kind();
    let outbound = match message {
        ClientMessage::Join { mode } => {
            let outcome = matchmaker.join(from, mode);
            if let JoinOutcome::ModeMismatch { joined } = outcome {
                debug!(
                    connection_id = %from,
                    joined = %joined,
                    requested = %mode,
                    "ignoring join for a different mode"
                );
            }
            return Dispatch::Joined(outcome);
        }
        ClientMessage::Leave => {
            matchmaker.leave(from);
            return Dispatch::Left;
        }
        ClientMessage::Chat { text } => Outbound::Message(ServerMessage::Chat { text }),
        ClientMessage::Offer { .. } | ClientMessage::Answer { .. } | ClientMessage::Ice { .. } => {
            Outbound::Relay(raw.to_owned())
        }
    };

    match matchmaker.relay(from, outbound) {
        RelayOutcome::Delivered { .. } => {
            counter!("driftwood_road_messages_relayed_total", 1, "type" => kind);
            Dispatch::Relayed
        }
        RelayOutcome::NoPartner => {
            counter!("driftwood_road_frames_dropped_total", 1, "reason" => "no_partner");
            debug!(connection_id = %from, kind, "no partner to relay to");
            Dispatch::Dropped("no_partner")
        }
        RelayOutcome::PartnerClosed => {
            counter!("driftwood_road_frames_dropped_total", 1, "reason" => "partner_closed");
            debug!(connection_id = %from, kind, "partner transport closed");
            Dispatch::Dropped("partner_closed")
        }
    }
}

fn drop_frame(from: ConnectionId, err: &FrameError) -> Dispatch {
    let reason = err.metric_label();
    counter!("driftwood_road_frames_dropped_total", 1, "reason" => reason);
    debug!(connection_id = %from, error = %err, "dropping undecodable frame");
    Dispatch::Dropped(reason)
}
