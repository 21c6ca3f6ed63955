use std::sync::Arc;

use async_trait::async_trait;
use driftwood_proto::{IceCandidate, Mode, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, rtp_receiver::RTCRtpReceiver},
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::engine::{EngineError, PeerEngine};

/// [`PeerEngine`] backed by webrtc-rs. Video mode attaches an Opus audio
/// track and a VP8 video track; whoever captures media writes samples into
/// [`WebRtcEngine::local_tracks`].
///
/// webrtc-rs refuses a rollback local description, so a rollback replaces
/// the peer connection with a fresh one in the `stable` state. The tracks and
/// the candidate channel carry over to the replacement.
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    peer_connection: Option<Arc<RTCPeerConnection>>,
    prepared: Option<(Mode, mpsc::UnboundedSender<IceCandidate>)>,
    local_tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| EngineError::Setup(format!("failed to register codecs: {err}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| EngineError::Setup(format!("failed to register interceptors: {err}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            peer_connection: None,
            prepared: None,
            local_tracks: Vec::new(),
        })
    }

    pub fn local_tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.local_tracks
    }

    fn connection(&self) -> Result<&Arc<RTCPeerConnection>, EngineError> {
        self.peer_connection.as_ref().ok_or(EngineError::NotPrepared)
    }

    /// Builds a peer connection wired to `candidates`, with the local tracks
    /// attached in video mode.
    async fn open(
        &mut self,
        mode: Mode,
        candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<Arc<RTCPeerConnection>, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|err| EngineError::Setup(err.to_string()))?,
        );

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates.send(to_candidate(init));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize local ice candidate"),
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(|state: RTCPeerConnectionState| {
            Box::pin(async move {
                info!(state = %state, "peer connection state changed");
            })
        }));

        pc.on_track(Box::new(
            |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _| {
                Box::pin(async move {
                    info!(
                        kind = %track.kind(),
                        codec = %track.codec().capability.mime_type,
                        "remote track started"
                    );
                })
            },
        ));

        if mode == Mode::Video {
            if self.local_tracks.is_empty() {
                self.local_tracks = media_tracks();
            }
            for track in &self.local_tracks {
                if let Err(err) = pc
                    .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                {
                    close(&pc).await;
                    return Err(EngineError::operation("add track", err));
                }
            }
        }
        Ok(pc)
    }
}

fn media_tracks() -> Vec<Arc<TrackLocalStaticSample>> {
    let audio = TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        "driftwood".to_owned(),
    );
    let video = TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
        "video".to_owned(),
        "driftwood".to_owned(),
    );
    vec![Arc::new(audio), Arc::new(video)]
}

async fn close(pc: &RTCPeerConnection) {
    if let Err(err) = pc.close().await {
        warn!(error = %err, "failed to close peer connection");
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let invalid = |err: webrtc::Error| EngineError::InvalidDescription(err.to_string());
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(invalid),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(invalid),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp).map_err(invalid),
        SdpKind::Rollback => Ok(rollback_description()),
    }
}

fn rollback_description() -> RTCSessionDescription {
    let mut rollback = RTCSessionDescription::default();
    rollback.sdp_type = RTCSdpType::Rollback;
    rollback
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(EngineError::InvalidDescription(
                "local description has no type".into(),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn to_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn prepare(
        &mut self,
        mode: Mode,
        candidates: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<(), EngineError> {
        self.release().await;
        let pc = self.open(mode, candidates.clone()).await?;
        debug!(mode = %mode, "peer connection prepared");
        self.peer_connection = Some(pc);
        self.prepared = Some((mode, candidates));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, EngineError> {
        let pc = self.connection()?;
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|err| EngineError::operation("create offer", err))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|err| EngineError::operation("set local offer", err))?;
        from_rtc(&offer)
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        if self.connection()?.signaling_state() != RTCSignalingState::HaveLocalOffer {
            return Ok(());
        }
        let Some((mode, candidates)) = self.prepared.clone() else {
            return Err(EngineError::NotPrepared);
        };
        let fresh = self.open(mode, candidates).await?;
        if let Some(stale) = self.peer_connection.replace(fresh) {
            close(&stale).await;
        }
        debug!("local offer rolled back onto a fresh peer connection");
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description = to_rtc(description)?;
        self.connection()?
            .set_remote_description(description)
            .await
            .map_err(|err| EngineError::operation("set remote description", err))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        let pc = self.connection()?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|err| EngineError::operation("create answer", err))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|err| EngineError::operation("set local answer", err))?;
        from_rtc(&answer)
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.connection()?
            .add_ice_candidate(init)
            .await
            .map_err(|err| EngineError::operation("add ice candidate", err))
    }

    async fn release(&mut self) {
        self.local_tracks.clear();
        self.prepared = None;
        if let Some(pc) = self.peer_connection.take() {
            close(&pc).await;
            debug!("peer connection released");
        }
    }
}
