//! whip-vision - WHIP video ingest with object detection
//!
//! A WebRTC publisher pushes video over WHIP. The latest decoded frame is
//! kept in a single slot, a rate-bounded scheduler hands fresh frames to an
//! object detector one at a time, and an annotated MJPEG preview plus JSON
//! query endpoints expose the results.

pub mod config;
pub mod error;
pub mod inference;
pub mod state;
pub mod stats;
pub mod stream;
pub mod utils;
pub mod video;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
