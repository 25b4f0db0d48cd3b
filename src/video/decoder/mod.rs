//! Video decoders for incoming WebRTC tracks
//!
//! Tracks deliver compressed access units (H.264 Annex-B, VP8). A decoder
//! turns them into RGB24 frames for the frame store. The GStreamer backend
//! is only compiled with the `gstreamer` feature; without it, video tracks
//! are accepted but produce no frames.

#[cfg(feature = "gstreamer")]
pub mod gstreamer;

use image::RgbImage;
use tracing::warn;

use crate::video::TransportError;

/// Decoder for one compressed video track
pub trait VideoDecoder: Send {
    /// Feed one access unit; `Ok(None)` when no picture is ready yet
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RgbImage>, TransportError>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// Compressed codecs a track can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackCodec {
    H264,
    Vp8,
}

impl TrackCodec {
    /// Match an RTP codec MIME type (case-insensitive)
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "video/h264" => Some(Self::H264),
            "video/vp8" => Some(Self::Vp8),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrackCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "H264"),
            Self::Vp8 => write!(f, "VP8"),
        }
    }
}

/// Create the best available decoder for a codec
pub fn create_decoder(codec: TrackCodec) -> Option<Box<dyn VideoDecoder>> {
    #[cfg(feature = "gstreamer")]
    {
        match gstreamer::GstDecoder::new(codec) {
            Ok(decoder) => return Some(Box::new(decoder)),
            Err(e) => warn!("GStreamer {} decoder unavailable: {}", codec, e),
        }
    }

    warn!(
        "No {} decoder available; build with the `gstreamer` feature to decode video",
        codec
    );
    None
}
