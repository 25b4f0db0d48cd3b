//! Receive-only WebRTC peer connections
//!
//! [`PeerTransport`] is the seam between the session registry and the media
//! stack: it turns an SDP offer into an answer plus a handle for trickle
//! ICE and teardown, and reports connection state and incoming tracks as
//! [`TransportEvent`]s.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::signaling::{IceCandidate, SignalingError};
use super::track::TrackFrameSource;
use crate::config::WebRtcConfig;
use crate::video::{FrameSource, TrackCodec};

/// Keyframe request interval for incoming video tracks
const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Events a negotiated peer reports back to its session
pub enum TransportEvent {
    StateChanged(PeerState),
    /// A remote video track started; frames are read from the source
    Track(Box<dyn FrameSource>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::StateChanged(state) => write!(f, "StateChanged({})", state),
            TransportEvent::Track(source) => write!(f, "Track({})", source.describe()),
        }
    }
}

/// Control surface of one negotiated peer
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError>;

    async fn close(&self) -> Result<(), SignalingError>;
}

/// Result of a successful negotiation
pub struct Negotiated {
    /// SDP answer with gathered candidates
    pub answer: String,
    pub handle: Box<dyn PeerHandle>,
}

/// Creates peers from SDP offers
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn negotiate(
        &self,
        session_id: &str,
        offer: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Negotiated, SignalingError>;
}

/// `webrtc-rs` backed transport
pub struct WebRtcTransport {
    config: WebRtcConfig,
}

impl WebRtcTransport {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SignalingError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SignalingError::Transport(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            SignalingError::Transport(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            SignalingError::Transport(format!("Failed to create peer connection: {}", e))
        })?;

        Ok(Arc::new(pc))
    }

    async fn answer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        offer: &str,
    ) -> Result<String, SignalingError> {
        let offer = RTCSessionDescription::offer(offer.to_string())
            .map_err(|e| SignalingError::MalformedOffer(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| SignalingError::MalformedOffer(format!("Offer rejected: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| SignalingError::Transport(format!("Failed to create answer: {}", e)))?;

        // Must subscribe before setting the local description
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await.map_err(|e| {
            SignalingError::Transport(format!("Failed to set local description: {}", e))
        })?;

        let timeout = self.config.ice_gathering_timeout();
        if tokio::time::timeout(timeout, gather_complete.recv())
            .await
            .is_err()
        {
            debug!(
                "ICE gathering not complete after {:?}, answering with partial candidates",
                timeout
            );
        }

        pc.local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| SignalingError::Transport("No local description".to_string()))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn negotiate(
        &self,
        session_id: &str,
        offer: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Negotiated, SignalingError> {
        let pc = self.create_peer_connection().await?;
        install_handlers(&pc, session_id, events);

        match self.answer(&pc, offer).await {
            Ok(answer) => Ok(Negotiated {
                answer,
                handle: Box::new(WebRtcPeer { pc }),
            }),
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    debug!("Failed to close rejected peer {}: {}", session_id, close_err);
                }
                Err(e)
            }
        }
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    session_id: &str,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let state_events = events.clone();
    let id = session_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let events = state_events.clone();
        let id = id.clone();

        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                    PeerState::Connecting
                }
                RTCPeerConnectionState::Connected => PeerState::Connected,
                RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                RTCPeerConnectionState::Failed => PeerState::Failed,
                RTCPeerConnectionState::Closed => PeerState::Closed,
                _ => return,
            };

            info!("Peer {} connection state: {}", id, state);
            let _ = events.send(TransportEvent::StateChanged(state));
        })
    }));

    let weak_pc = Arc::downgrade(pc);
    let id = session_id.to_string();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            let weak_pc = weak_pc.clone();
            let id = id.clone();

            Box::pin(async move {
                if track.kind() != RTPCodecType::Video {
                    debug!("Ignoring {} track on session {}", track.kind(), id);
                    return;
                }

                let mime = track.codec().capability.mime_type;
                let Some(codec) = TrackCodec::from_mime(&mime) else {
                    warn!("Unsupported video codec {} on session {}", mime, id);
                    return;
                };

                info!(
                    "Session {} receiving {} track (ssrc {})",
                    id,
                    codec,
                    track.ssrc()
                );
                spawn_keyframe_requests(weak_pc, track.ssrc());

                let source = TrackFrameSource::new(track, codec);
                let _ = events.send(TransportEvent::Track(Box::new(source)));
            })
        },
    ));
}

/// Periodically ask the sender for a keyframe so decoding can (re)start
fn spawn_keyframe_requests(pc: Weak<RTCPeerConnection>, media_ssrc: u32) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PLI_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(pc) = pc.upgrade() else {
                break;
            };
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if pc.write_rtcp(&[Box::new(pli)]).await.is_err() {
                break;
            }
        }
    });
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| SignalingError::Transport(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), SignalingError> {
        self.pc
            .close()
            .await
            .map_err(|e| SignalingError::Transport(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[test]
    fn test_ice_servers_from_config() {
        let transport = WebRtcTransport::new(WebRtcConfig {
            stun_servers: vec!["stun:stun.example.org:3478".to_string()],
            turn_servers: vec![TurnServer {
                urls: vec!["turn:turn.example.org:3478".to_string()],
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
            ..WebRtcConfig::default()
        });

        let servers = transport.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[tokio::test]
    async fn test_invalid_offer_is_rejected() {
        let transport = WebRtcTransport::new(WebRtcConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = transport.negotiate("test", "not an offer", tx).await;
        assert!(matches!(result, Err(SignalingError::MalformedOffer(_))));
    }
}
