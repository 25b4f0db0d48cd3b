//! WHIP signaling types: session states, offer validation and trickle
//! ICE fragments (`application/trickle-ice-sdpfrag`)

use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;
use webrtc::sdp::SessionDescription;

/// Signaling failures surfaced to WHIP clients
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Malformed SDP offer: {0}")]
    MalformedOffer(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Signaling state of a session
///
/// `Negotiating -> Connected -> Closed`, with `Failed` reachable from
/// either live state. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (SessionState::Negotiating, SessionState::Connected) => true,
            (SessionState::Negotiating | SessionState::Connected, SessionState::Closed) => true,
            (SessionState::Negotiating | SessionState::Connected, SessionState::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string (`candidate:...`, without the `a=` prefix)
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

/// Summary of a validated SDP offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferSummary {
    /// Media kinds in m-line order (`video`, `audio`, ...)
    pub media: Vec<String>,
}

impl OfferSummary {
    pub fn has_video(&self) -> bool {
        self.media.iter().any(|m| m == "video")
    }
}

/// Check that an offer parses as SDP and carries at least one media section
pub fn validate_offer(sdp: &str) -> Result<OfferSummary, SignalingError> {
    if sdp.trim().is_empty() {
        return Err(SignalingError::MalformedOffer("empty offer".to_string()));
    }

    let mut reader = Cursor::new(sdp.as_bytes());
    let parsed = SessionDescription::unmarshal(&mut reader)
        .map_err(|e| SignalingError::MalformedOffer(e.to_string()))?;

    let media: Vec<String> = parsed
        .media_descriptions
        .iter()
        .map(|m| m.media_name.media.clone())
        .collect();
    if media.is_empty() {
        return Err(SignalingError::MalformedOffer(
            "offer has no media sections".to_string(),
        ));
    }

    Ok(OfferSummary { media })
}

/// Parsed trickle ICE fragment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrickleFragment {
    pub candidates: Vec<IceCandidate>,
    /// Candidate lines that were malformed and skipped
    pub skipped: usize,
    pub end_of_candidates: bool,
}

/// Parse an `application/trickle-ice-sdpfrag` body
///
/// Candidate lines inherit the `a=mid` and m-line index of the media
/// section they appear in and the most recent `a=ice-ufrag`. Malformed
/// candidate lines are skipped individually. Bare `candidate:` lines
/// without the `a=` prefix are accepted as well.
pub fn parse_trickle_fragment(body: &str) -> TrickleFragment {
    let mut fragment = TrickleFragment::default();
    let mut ufrag: Option<String> = None;
    let mut mid: Option<String> = None;
    let mut mline_index: Option<u16> = None;

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let attr = line.strip_prefix("a=").unwrap_or(line);

        if line.starts_with("m=") {
            mline_index = Some(mline_index.map_or(0, |i| i + 1));
            mid = None;
        } else if let Some(value) = attr.strip_prefix("ice-ufrag:") {
            ufrag = Some(value.to_string());
        } else if let Some(value) = attr.strip_prefix("mid:") {
            mid = Some(value.to_string());
        } else if attr == "end-of-candidates" {
            fragment.end_of_candidates = true;
        } else if attr.starts_with("candidate:") {
            if is_well_formed_candidate(attr) {
                fragment.candidates.push(IceCandidate {
                    candidate: attr.to_string(),
                    sdp_mid: mid.clone(),
                    sdp_mline_index: mline_index,
                    username_fragment: ufrag.clone(),
                });
            } else {
                fragment.skipped += 1;
            }
        }
    }

    fragment
}

/// `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> ...`
fn is_well_formed_candidate(attr: &str) -> bool {
    let Some(rest) = attr.strip_prefix("candidate:") else {
        return false;
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 8 || fields[6] != "typ" {
        return false;
    }
    let component_ok = fields[1].parse::<u16>().is_ok();
    let priority_ok = fields[3].parse::<u32>().is_ok();
    let port_ok = fields[5].parse::<u16>().is_ok();
    let kind_ok = matches!(fields[7], "host" | "srflx" | "prflx" | "relay");
    component_ok && priority_ok && port_ok && kind_ok
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal browser-style WHIP offer with one H.264 video section
    pub(crate) const VIDEO_OFFER: &str = "v=0\r\n\
o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:EsAw\r\n\
a=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 H264/90000\r\n";

    pub(crate) const CANDIDATE_LINE: &str =
        "a=candidate:1387637174 1 udp 2122260223 192.0.2.1 61764 typ host generation 0";

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Negotiating.can_transition_to(Connected));
        assert!(Negotiating.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Closed));
        assert!(Connected.can_transition_to(Failed));
        assert!(!Connected.can_transition_to(Negotiating));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Closed));
        assert!(Closed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_validate_offer() {
        let summary = validate_offer(VIDEO_OFFER).unwrap();
        assert_eq!(summary.media, vec!["video".to_string()]);
        assert!(summary.has_video());
    }

    #[test]
    fn test_malformed_offers_rejected() {
        assert!(matches!(
            validate_offer(""),
            Err(SignalingError::MalformedOffer(_))
        ));
        assert!(matches!(
            validate_offer("this is not sdp"),
            Err(SignalingError::MalformedOffer(_))
        ));

        let no_media = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        assert!(matches!(
            validate_offer(no_media),
            Err(SignalingError::MalformedOffer(_))
        ));
    }

    #[test]
    fn test_parse_trickle_fragment() {
        let body = format!(
            "a=ice-ufrag:EsAw\r\na=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n{}\r\n\
             a=candidate:broken line\r\na=end-of-candidates\r\n",
            CANDIDATE_LINE
        );
        let fragment = parse_trickle_fragment(&body);

        assert_eq!(fragment.candidates.len(), 1);
        assert_eq!(fragment.skipped, 1);
        assert!(fragment.end_of_candidates);

        let candidate = &fragment.candidates[0];
        assert!(candidate.candidate.starts_with("candidate:1387637174"));
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("EsAw"));
    }

    #[test]
    fn test_bare_candidate_line() {
        let fragment = parse_trickle_fragment(
            "candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ srflx raddr 0.0.0.0 rport 0",
        );
        assert_eq!(fragment.candidates.len(), 1);
        assert_eq!(fragment.candidates[0].sdp_mid, None);
        assert_eq!(fragment.skipped, 0);
    }
}
