//! Frame source over a remote WebRTC video track

use async_trait::async_trait;
use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_remote::TrackRemote;

use crate::video::{create_decoder, FrameSource, RawFrame, TrackCodec, TransportError, VideoDecoder};

/// Packets the sample builder may hold back while waiting for reordering
const MAX_LATE_PACKETS: u16 = 128;
const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Codec-specific RTP reassembly
enum Reassembler {
    H264(SampleBuilder<H264Packet>),
    Vp8(SampleBuilder<Vp8Packet>),
}

impl Reassembler {
    fn new(codec: TrackCodec) -> Self {
        match codec {
            TrackCodec::H264 => Self::H264(SampleBuilder::new(
                MAX_LATE_PACKETS,
                H264Packet::default(),
                VIDEO_CLOCK_RATE,
            )),
            TrackCodec::Vp8 => Self::Vp8(SampleBuilder::new(
                MAX_LATE_PACKETS,
                Vp8Packet::default(),
                VIDEO_CLOCK_RATE,
            )),
        }
    }

    fn push(&mut self, packet: Packet) {
        match self {
            Self::H264(builder) => builder.push(packet),
            Self::Vp8(builder) => builder.push(packet),
        }
    }

    fn pop(&mut self) -> Option<Sample> {
        match self {
            Self::H264(builder) => builder.pop(),
            Self::Vp8(builder) => builder.pop(),
        }
    }
}

/// Reads RTP from a remote track and yields whole access units
pub struct TrackFrameSource {
    track: Arc<TrackRemote>,
    codec: TrackCodec,
    reassembler: Reassembler,
    decoder: Option<Box<dyn VideoDecoder>>,
}

impl TrackFrameSource {
    pub fn new(track: Arc<TrackRemote>, codec: TrackCodec) -> Self {
        Self {
            track,
            codec,
            reassembler: Reassembler::new(codec),
            decoder: create_decoder(codec),
        }
    }
}

#[async_trait]
impl FrameSource for TrackFrameSource {
    async fn recv(&mut self) -> Result<RawFrame, TransportError> {
        loop {
            if let Some(sample) = self.reassembler.pop() {
                return Ok(RawFrame {
                    data: sample.data,
                    received_at: Instant::now(),
                });
            }

            let (packet, _) = self.track.read_rtp().await.map_err(|e| {
                let message = e.to_string();
                let lower = message.to_ascii_lowercase();
                if lower.contains("closed") || lower.contains("eof") {
                    TransportError::Closed
                } else {
                    TransportError::Read(message)
                }
            })?;
            self.reassembler.push(packet);
        }
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<Option<RgbImage>, TransportError> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.decode(&frame.data),
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        let backend = self.decoder.as_ref().map_or("none", |d| d.name());
        format!(
            "{} track {} (ssrc {}, decoder {})",
            self.codec,
            self.track.id(),
            self.track.ssrc(),
            backend
        )
    }
}
