//! Frame source abstraction over the media transport

use async_trait::async_trait;
use bytes::Bytes;
use image::RgbImage;
use std::time::Instant;
use thiserror::Error;

/// Media transport errors seen by the capture loop
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No frame arrived within the read timeout (transient)
    #[error("Frame read timed out")]
    Timeout,

    /// The track or connection has ended
    #[error("Track closed")]
    Closed,

    /// Read failure on the transport
    #[error("Transport read failed: {0}")]
    Read(String),

    /// Frame could not be decoded
    #[error("Frame decode failed: {0}")]
    Decode(String),
}

/// An encoded frame as delivered by the transport
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Encoded access unit (e.g. Annex-B H.264, VP8 frame)
    pub data: Bytes,
    /// Arrival time at the transport boundary
    pub received_at: Instant,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            received_at: Instant::now(),
        }
    }
}

/// Source of frames for a single video track
///
/// `recv` waits for the next encoded frame; `decode` turns it into the
/// shared RGB representation. Decoders are stateful: every received frame
/// must be passed to `decode`, even when the result will be discarded.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next encoded frame
    async fn recv(&mut self) -> Result<RawFrame, TransportError>;

    /// Decode an encoded frame; `Ok(None)` when the decoder needs more input
    fn decode(&mut self, frame: &RawFrame) -> Result<Option<RgbImage>, TransportError>;

    /// Short description for logs (codec, track id)
    fn describe(&self) -> String;
}
