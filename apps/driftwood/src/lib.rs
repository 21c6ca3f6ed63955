//! Terminal client for driftwood: joins the matchmaking server, relays chat
//! lines and, in video mode, negotiates a WebRTC peer connection with the
//! stranger it is paired with.

pub mod config;
pub mod engine;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod terminal;
pub mod webrtc_engine;
