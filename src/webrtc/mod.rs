//! WHIP ingest over WebRTC
//!
//! ```text
//! WHIP client --- SDP offer / trickle ICE / DELETE ---> HTTP handlers
//!                                                          |
//!                                                   SessionRegistry
//!                                                          |
//!                                             PeerTransport (webrtc-rs)
//!                                                          |
//!                                         remote video track (RTP)
//!                                                          |
//!                                      TrackFrameSource -> CaptureIngest
//! ```

pub mod peer;
pub mod session;
pub mod signaling;
pub mod track;

pub use peer::{
    Negotiated, PeerHandle, PeerState, PeerTransport, TransportEvent, WebRtcTransport,
};
pub use session::{SessionInfo, SessionRegistry, TrickleOutcome};
pub use signaling::{
    parse_trickle_fragment, validate_offer, IceCandidate, OfferSummary, SessionState,
    SignalingError, TrickleFragment,
};
pub use track::TrackFrameSource;
