//! Video ingest: frame sources, decoding, capture loop and the frame store

pub mod capture;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod source;

pub use capture::{CaptureIngest, CaptureSettings};
pub use decoder::{create_decoder, TrackCodec, VideoDecoder};
pub use encoder::JpegEncoder;
pub use frame::{unix_timestamp, Frame, FrameStamp, FrameStore};
pub use source::{FrameSource, RawFrame, TransportError};
