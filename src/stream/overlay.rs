//! Detection overlay rendering

use ab_glyph::{FontArc, PxScale};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::{info, warn};

use crate::inference::Detection;

const ANOMALY_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const NORMAL_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const ANOMALY_THICKNESS: i32 = 3;
const NORMAL_THICKNESS: i32 = 2;
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_HEIGHT: u32 = 18;
/// Rough per-character width when no font is loaded
const LABEL_CHAR_WIDTH: u32 = 8;

/// Draws detection boxes and labels onto frames
pub struct Overlay {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Overlay {
    /// Overlay that draws boxes and label bars but no text
    pub fn without_font() -> Self {
        Self {
            font: None,
            scale: PxScale::from(LABEL_FONT_SIZE),
        }
    }

    /// Load a TTF/OTF font for label text; falls back to boxes only
    pub fn load(font_path: Option<&Path>) -> Self {
        let Some(path) = font_path else {
            return Self::without_font();
        };

        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|data| FontArc::try_from_vec(data).map_err(|e| e.to_string()));
        match font {
            Ok(font) => {
                info!("Loaded overlay font {}", path.display());
                Self {
                    font: Some(font),
                    scale: PxScale::from(LABEL_FONT_SIZE),
                }
            }
            Err(e) => {
                warn!(
                    "Failed to load overlay font {}: {}; labels will have no text",
                    path.display(),
                    e
                );
                Self::without_font()
            }
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw every detection onto `image` (bbox in image pixels)
    pub fn draw(&self, image: &mut RgbImage, detections: &[Detection]) {
        for detection in detections {
            self.draw_one(image, detection);
        }
    }

    fn draw_one(&self, image: &mut RgbImage, detection: &Detection) {
        let (w, h) = (image.width() as f32, image.height() as f32);
        if w < 1.0 || h < 1.0 {
            return;
        }

        let [x1, y1, x2, y2] = detection.bbox;
        let x_min = x1.min(x2).floor().clamp(0.0, w - 1.0) as i32;
        let y_min = y1.min(y2).floor().clamp(0.0, h - 1.0) as i32;
        let x_max = x1.max(x2).ceil().clamp(0.0, w - 1.0) as i32;
        let y_max = y1.max(y2).ceil().clamp(0.0, h - 1.0) as i32;
        if x_min >= x_max || y_min >= y_max {
            return;
        }

        let (color, thickness) = if detection.is_anomaly {
            (ANOMALY_COLOR, ANOMALY_THICKNESS)
        } else {
            (NORMAL_COLOR, NORMAL_THICKNESS)
        };

        for t in 0..thickness {
            let width = x_max - x_min + 1 - 2 * t;
            let height = y_max - y_min + 1 - 2 * t;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(image, rect, color);
        }

        let label = label_text(detection);
        let text_width = match &self.font {
            Some(font) => text_size(self.scale, font, &label).0 + 4,
            None => label.chars().count() as u32 * LABEL_CHAR_WIDTH,
        };
        let label_x = x_min;
        let label_y = (y_min - LABEL_HEIGHT as i32).max(0);
        let label_width = text_width.min(image.width() - label_x as u32);
        if label_width == 0 {
            return;
        }

        draw_filled_rect_mut(
            image,
            Rect::at(label_x, label_y).of_size(label_width, LABEL_HEIGHT),
            color,
        );
        if let Some(font) = &self.font {
            draw_text_mut(image, TEXT_COLOR, label_x + 2, label_y + 1, self.scale, font, &label);
        }
    }
}

/// `"person 87%"`, or `"person 87% #12"` for tracked objects
fn label_text(detection: &Detection) -> String {
    let percent = (detection.confidence * 100.0).round() as u32;
    match detection.track_id {
        Some(track) => format!("{} {}% #{}", detection.class_name, percent, track),
        None => format!("{} {}%", detection.class_name, percent),
    }
}

/// Downsample to at most `max_width` pixels wide, keeping the aspect ratio
pub fn downscale(image: RgbImage, max_width: u32) -> RgbImage {
    if max_width == 0 || image.width() <= max_width {
        return image;
    }
    let height = ((image.height() as u64 * max_width as u64) / image.width() as u64).max(1) as u32;
    image::imageops::resize(&image, max_width, height, FilterType::Triangle)
}
