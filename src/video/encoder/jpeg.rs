//! JPEG encoder implementation
//!
//! Encodes RGB24 frames with turbojpeg. Chroma is subsampled 4:2:0, which
//! matches what browsers expect from an MJPEG stream.

use bytes::Bytes;
use image::RgbImage;

use super::EncodeError;

/// JPEG encoder using turbojpeg
///
/// Note: This encoder is NOT thread-safe due to turbojpeg limitations.
/// Use it from a single thread or wrap in a Mutex.
pub struct JpegEncoder {
    compressor: turbojpeg::Compressor,
}

impl JpegEncoder {
    /// Create an encoder with the given quality (clamped to 1-100)
    pub fn new(quality: u8) -> Result<Self, EncodeError> {
        let mut compressor = turbojpeg::Compressor::new()
            .map_err(|e| EncodeError::Init(format!("Failed to create turbojpeg compressor: {}", e)))?;
        let quality = quality.clamp(1, 100);

        compressor
            .set_quality(quality as i32)
            .map_err(|e| EncodeError::Init(format!("Failed to set JPEG quality: {}", e)))?;
        compressor
            .set_subsamp(turbojpeg::Subsamp::Sub2x2)
            .map_err(|e| EncodeError::Init(format!("Failed to set subsampling: {}", e)))?;

        Ok(Self { compressor })
    }

    /// Encode an RGB24 image
    pub fn encode_rgb(&mut self, image: &RgbImage) -> Result<Bytes, EncodeError> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        if width == 0 || height == 0 {
            return Err(EncodeError::InvalidInput(format!(
                "Empty image: {}x{}",
                width, height
            )));
        }

        let pixels = image.as_raw();
        let turbo_image = turbojpeg::Image {
            pixels: pixels.as_slice(),
            width,
            pitch: width * 3,
            height,
            format: turbojpeg::PixelFormat::RGB,
        };

        let jpeg = self
            .compressor
            .compress_to_vec(turbo_image)
            .map_err(|e| EncodeError::Compress(e.to_string()))?;

        Ok(Bytes::from(jpeg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_encode_rgb_produces_jpeg() {
        let mut encoder = JpegEncoder::new(85).unwrap();
        let image = RgbImage::from_pixel(64, 48, Rgb([200, 10, 10]));

        let jpeg = encoder.encode_rgb(&image).unwrap();
        assert!(jpeg.len() > 4);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_empty_image_rejected() {
        let mut encoder = JpegEncoder::new(85).unwrap();
        let image = RgbImage::new(0, 0);
        assert!(matches!(
            encoder.encode_rgb(&image),
            Err(EncodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_out_of_range_quality_is_clamped() {
        let image = RgbImage::from_pixel(16, 16, Rgb([0, 120, 0]));
        for quality in [0, 250] {
            let mut encoder = JpegEncoder::new(quality).unwrap();
            assert_eq!(&encoder.encode_rgb(&image).unwrap()[..2], &[0xFF, 0xD8]);
        }
    }
}
