//! Wire envelope shared by the driftwood matchmaking server and its clients.
//! Kept in a dedicated crate so the server never depends on the client's
//! peer-connection stack.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Matchmaking pool a connection asks to join.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Chat,
    Video,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Video => "video",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chat" => Ok(Mode::Chat),
            "video" => Ok(Mode::Video),
            other => Err(ProtoError::UnknownMode(other.to_string())),
        }
    }
}

/// Messages sent from a client to the matchmaking server.
///
/// Negotiation payloads stay opaque `Value`s: the server relays them without
/// looking inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join { mode: Mode },
    Chat { text: String },
    Offer { offer: Value },
    Answer { answer: Value },
    Ice { candidate: Value },
    Leave,
}

/// Messages sent from the matchmaking server to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Waiting,
    Paired { initiator: bool },
    Chat { text: String },
    Offer { offer: Value },
    Answer { answer: Value },
    Ice { candidate: Value },
    PartnerLeft,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Chat { .. } => "chat",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::Ice { .. } => "ice",
            ClientMessage::Leave => "leave",
        }
    }

    pub fn offer(description: &SessionDescription) -> Result<Self, ProtoError> {
        Ok(ClientMessage::Offer {
            offer: description.to_value()?,
        })
    }

    pub fn answer(description: &SessionDescription) -> Result<Self, ProtoError> {
        Ok(ClientMessage::Answer {
            answer: description.to_value()?,
        })
    }

    pub fn ice(candidate: &IceCandidate) -> Result<Self, ProtoError> {
        Ok(ClientMessage::Ice {
            candidate: candidate.to_value()?,
        })
    }
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Waiting => "waiting",
            ServerMessage::Paired { .. } => "paired",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::Ice { .. } => "ice",
            ServerMessage::PartnerLeft => "partner-left",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the browser's `{ type, sdp }` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        Self::deserialize(value).map_err(ProtoError::InvalidDescription)
    }

    pub fn to_value(&self) -> Result<Value, ProtoError> {
        serde_json::to_value(self).map_err(ProtoError::Encode)
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        Self::deserialize(value).map_err(ProtoError::InvalidCandidate)
    }

    pub fn to_value(&self) -> Result<Value, ProtoError> {
        serde_json::to_value(self).map_err(ProtoError::Encode)
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown mode: {0}")]
    UnknownMode(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(serde_json::Error),
    #[error("invalid ice candidate: {0}")]
    InvalidCandidate(serde_json::Error),
    #[error("failed to encode payload: {0}")]
    Encode(serde_json::Error),
}
