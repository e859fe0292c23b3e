//! Resize + JPEG encode shared by every strategy.
//!
//! Strategies decode whatever the device hands back into an image, then
//! funnel it through [`encode_frame`] so all frames come out identically
//! shaped: at most `max_width` wide (aspect preserved, bilinear), RGB JPEG
//! at the requested quality.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, RgbaImage};
use tracing::debug;

use crate::error::CaptureError;
use crate::types::{CaptureParams, Frame};

/// Channel ceiling below which a sampled pixel counts as black.
const DARK_THRESHOLD: u8 = 16;

/// Fraction of dark samples above which a frame is reported.
const DARK_RATIO_LIMIT: f32 = 0.98;

/// Roughly how many pixels the dark-ratio diagnostic inspects.
const DARK_SAMPLES: usize = 1024;

/// Encode `img` into a [`Frame`] that records its native dimensions.
pub fn encode_frame(img: DynamicImage, quality: u8, max_width: u32) -> Result<Frame, CaptureError> {
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(CaptureError::Image(format!("empty image {width}x{height}")));
    }

    let rgb = img.into_rgb8();
    let rgb = if width > max_width {
        let scaled_h = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
        imageops::resize(&rgb, max_width, scaled_h, FilterType::Triangle)
    } else {
        rgb
    };

    let mut jpeg = Vec::with_capacity((rgb.width() * rgb.height() / 4) as usize);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(Frame::new(jpeg, width, height))
}

/// Encode raw RGBA8888 pixels on the blocking pool.
pub async fn encode_rgba(
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    params: CaptureParams,
    black_screen_check: bool,
) -> Result<Frame, CaptureError> {
    tokio::task::spawn_blocking(move || {
        if black_screen_check {
            let ratio = dark_ratio(&pixels);
            if ratio > DARK_RATIO_LIMIT {
                debug!(ratio, width, height, "frame is almost entirely black");
            }
        }
        let actual = pixels.len();
        let img = RgbaImage::from_raw(width, height, pixels).ok_or(CaptureError::IncompleteData {
            expected: width as usize * height as usize * 4,
            actual,
        })?;
        encode_frame(DynamicImage::ImageRgba8(img), params.quality, params.max_width)
    })
    .await?
}

/// Decode an encoded image (PNG from the device) and re-encode it on the
/// blocking pool.
pub async fn encode_encoded(data: Vec<u8>, params: CaptureParams) -> Result<Frame, CaptureError> {
    tokio::task::spawn_blocking(move || {
        let img = image::load_from_memory_with_format(&data, image::ImageFormat::Png)?;
        encode_frame(img, params.quality, params.max_width)
    })
    .await?
}

/// Share of sampled RGBA pixels whose colour channels are all near zero.
pub fn dark_ratio(rgba: &[u8]) -> f32 {
    let pixels = rgba.len() / 4;
    if pixels == 0 {
        return 0.0;
    }
    let step = (pixels / DARK_SAMPLES).max(1);
    let mut sampled = 0usize;
    let mut dark = 0usize;
    for px in rgba.chunks_exact(4).step_by(step) {
        sampled += 1;
        if px[..3].iter().all(|&c| c < DARK_THRESHOLD) {
            dark += 1;
        }
    }
    dark as f32 / sampled as f32
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params(max_width: u32) -> CaptureParams {
        CaptureParams {
            quality: 80,
            max_width,
            timeout: Duration::from_secs(5),
        }
    }

    fn jpeg_dims(frame: &Frame) -> (u32, u32) {
        let img = image::load_from_memory_with_format(frame.pixels(), image::ImageFormat::Jpeg)
            .unwrap();
        (img.width(), img.height())
    }

    #[tokio::test]
    async fn downscales_wide_frames_preserving_aspect() {
        let frame = encode_rgba(vec![90u8; 200 * 100 * 4], 200, 100, params(50), false)
            .await
            .unwrap();
        assert_eq!((frame.width(), frame.height()), (200, 100));
        assert_eq!(jpeg_dims(&frame), (50, 25));
    }

    #[tokio::test]
    async fn keeps_narrow_frames_as_is() {
        let frame = encode_rgba(vec![90u8; 40 * 30 * 4], 40, 30, params(540), true)
            .await
            .unwrap();
        assert_eq!(jpeg_dims(&frame), (40, 30));
    }

    #[tokio::test]
    async fn short_buffer_is_incomplete() {
        let err = encode_rgba(vec![0u8; 10], 4, 4, params(540), false).await.unwrap_err();
        assert!(matches!(err, CaptureError::IncompleteData { expected: 64, actual: 10 }));
    }

    #[test]
    fn dark_ratio_samples_pixels() {
        assert_eq!(dark_ratio(&[0, 0, 0, 255].repeat(100)), 1.0);
        assert_eq!(dark_ratio(&[200, 200, 200, 255].repeat(100)), 0.0);
        assert_eq!(dark_ratio(&[]), 0.0);
    }
}
