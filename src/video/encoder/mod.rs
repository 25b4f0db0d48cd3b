//! Image encoders
//!
//! JPEG is the only output format: it feeds both the MJPEG preview and the
//! HTTP detector upload.

pub mod jpeg;

use thiserror::Error;

pub use jpeg::JpegEncoder;

/// Encoder failures
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Encoder initialization failed: {0}")]
    Init(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("JPEG compression failed: {0}")]
    Compress(String),
}
