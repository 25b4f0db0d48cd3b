//! Annotated preview stream
//!
//! # Components
//!
//! - `Overlay` - draws detection boxes and labels onto a frame copy
//! - `PreviewEncoder` - periodic render/downsample/JPEG task
//! - `PreviewStore` - latest encoded preview served over HTTP multipart MJPEG

pub mod overlay;
pub mod preview;

pub use overlay::{downscale, Overlay};
pub use preview::{ClientGuard, PreviewEncoder, PreviewFrame, PreviewStore};
