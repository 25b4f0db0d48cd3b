//! GStreamer-backed H.264/VP8 decoder
//!
//! Each decoder owns a small `appsrc ! parse ! decode ! videoconvert !
//! appsink` pipeline. Access units are pushed in and RGB pictures pulled
//! out with a short timeout, so a decoder that is still buffering reports
//! `Ok(None)` instead of blocking the capture loop.

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, warn};

use super::{TrackCodec, VideoDecoder};
use crate::video::TransportError;

/// How long to wait for a decoded picture after pushing an access unit
const PULL_TIMEOUT_MS: u64 = 20;

#[derive(Error, Debug)]
pub enum GstDecoderError {
    #[error("GStreamer error: {0}")]
    Glib(#[from] gst::glib::Error),

    #[error("GStreamer state change failed: {0}")]
    StateChange(#[from] gst::StateChangeError),

    #[error("Pipeline element missing: {0}")]
    MissingElement(&'static str),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

pub struct GstDecoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    name: String,
}

impl GstDecoder {
    pub fn new(codec: TrackCodec) -> Result<Self, GstDecoderError> {
        gst::init()?;

        let decode = match codec {
            TrackCodec::H264 => {
                "video/x-h264,stream-format=byte-stream,alignment=au ! h264parse ! avdec_h264"
            }
            TrackCodec::Vp8 => "video/x-vp8 ! vp8dec",
        };
        let description = format!(
            "appsrc name=src is-live=true do-timestamp=true format=time caps={} ! \
             videoconvert ! video/x-raw,format=RGB ! \
             appsink name=sink max-buffers=2 drop=true sync=false",
            decode
        );
        debug!("GStreamer decoder pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| GstDecoderError::Pipeline("Failed to create pipeline".to_string()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or(GstDecoderError::MissingElement("appsrc"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| GstDecoderError::MissingElement("appsrc"))?;
        let appsink = pipeline
            .by_name("sink")
            .ok_or(GstDecoderError::MissingElement("appsink"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| GstDecoderError::MissingElement("appsink"))?;

        pipeline.set_state(gst::State::Playing)?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            name: format!("gstreamer-{}", codec),
        })
    }

    fn sample_to_rgb(sample: &gst::Sample) -> Result<RgbImage, TransportError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| TransportError::Decode("No buffer in sample".to_string()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| TransportError::Decode("No caps in sample".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| TransportError::Decode("Failed to get video info from caps".to_string()))?;

        if info.format() != gst_video::VideoFormat::Rgb {
            return Err(TransportError::Decode(format!(
                "Unexpected output format {:?}",
                info.format()
            )));
        }

        let width = info.width() as usize;
        let height = info.height() as usize;
        let stride = info.stride()[0] as usize;

        let map = buffer
            .map_readable()
            .map_err(|e| TransportError::Decode(format!("Failed to map buffer: {}", e)))?;
        let data = map.as_slice();

        let row = width * 3;
        if stride < row || data.len() < stride * (height.saturating_sub(1)) + row {
            return Err(TransportError::Decode(format!(
                "Buffer too small for {}x{} (stride {}, {} bytes)",
                width,
                height,
                stride,
                data.len()
            )));
        }

        let mut pixels = Vec::with_capacity(row * height);
        for y in 0..height {
            pixels.extend_from_slice(&data[y * stride..y * stride + row]);
        }

        RgbImage::from_raw(width as u32, height as u32, pixels)
            .ok_or_else(|| TransportError::Decode("Pixel buffer size mismatch".to_string()))
    }
}

impl VideoDecoder for GstDecoder {
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RgbImage>, TransportError> {
        let buffer = gst::Buffer::from_slice(access_unit.to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| TransportError::Decode(format!("push_buffer failed: {:?}", e)))?;

        match self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
        {
            Some(sample) => Self::sample_to_rgb(&sample).map(Some),
            None => Ok(None),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop GStreamer decoder pipeline: {}", e);
        }
    }
}
