//! Downsampler
//!
//! Turns raw encoded bytes into a bitmap whose longer edge does not exceed
//! `target_dimension × scale_factor`.
//!
//! JPEG sources are decoded directly at a reduced DCT scale (1/2, 1/4 or 1/8), so a
//! 3000px cover is never materialized at full size. Other formats are decoded under
//! an allocation limit and then reduced. If the scaled path rejects malformed bytes,
//! a plain decode under the same limit is attempted before giving up. Images over
//! the limit are rejected outright.

use std::io::Cursor;

use image::codecs::jpeg::JpegDecoder;
use image::io::{Limits, Reader as ImageReader};
use image::{DynamicImage, ImageDecoder, ImageError, ImageFormat, ImageResult};
use tracing::debug;

use super::Bitmap;
use crate::error::{Error, Result};
use crate::{DEFAULT_SCALE_FACTOR, DEFAULT_TARGET_DIMENSION};

/// Downsampling configuration
#[derive(Debug, Clone)]
pub struct DownsampleConfig {
    /// Target longer edge in display points
    pub target_dimension: u32,
    /// Display pixels per point
    pub scale_factor: f32,
    /// Allocation ceiling for formats without scaled decoding
    pub max_decode_alloc: u64,
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        Self {
            target_dimension: DEFAULT_TARGET_DIMENSION,
            scale_factor: DEFAULT_SCALE_FACTOR,
            max_decode_alloc: 256 * 1024 * 1024,
        }
    }
}

impl DownsampleConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.target_dimension == 0 {
            return Err(Error::Config("target_dimension must be non-zero".into()));
        }
        if !self.scale_factor.is_finite() || self.scale_factor <= 0.0 {
            return Err(Error::Config(format!(
                "scale_factor must be positive, got {}",
                self.scale_factor
            )));
        }
        if self.max_decode_alloc == 0 {
            return Err(Error::Config("max_decode_alloc must be non-zero".into()));
        }
        Ok(())
    }
}

/// Stateless downsampler; cheap to clone onto worker threads
#[derive(Debug, Clone)]
pub struct Downsampler {
    config: DownsampleConfig,
}

impl Default for Downsampler {
    fn default() -> Self {
        Self::new(DownsampleConfig::default())
    }
}

impl Downsampler {
    pub fn new(config: DownsampleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DownsampleConfig {
        &self.config
    }

    /// Maximum longer edge, in pixels, of any produced bitmap
    pub fn max_pixel_size(&self) -> u32 {
        let pixels = (self.config.target_dimension as f32 * self.config.scale_factor).floor();
        (pixels as u32).max(1)
    }

    /// Decode and reduce `data`. Returns `None` when the bytes are not an image or
    /// decoding would exceed `max_decode_alloc`.
    pub fn downsample(&self, data: &[u8]) -> Option<Bitmap> {
        let max = self.max_pixel_size();

        let decoded = match self.decode_scaled(data, max) {
            Ok(image) => image,
            Err(ImageError::Limits(e)) => {
                debug!("Image rejected by decode limits: {}", e);
                return None;
            }
            Err(e) => {
                debug!("Scaled decode failed ({}), trying direct decode", e);
                match self.decode_direct(data) {
                    Ok(image) => image,
                    Err(e) => {
                        debug!("Direct decode failed: {}", e);
                        return None;
                    }
                }
            }
        };

        Some(fit_within(decoded, max))
    }

    fn limits(&self) -> Limits {
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.config.max_decode_alloc);
        limits
    }

    fn decode_scaled(&self, data: &[u8], max: u32) -> ImageResult<DynamicImage> {
        let format = image::guess_format(data)?;

        if format == ImageFormat::Jpeg {
            let mut decoder = JpegDecoder::new(Cursor::new(data))?;
            decoder.set_limits(self.limits())?;
            let (width, height) = decoder.dimensions();
            let (w, h) = fit_dimensions(width, height, max);
            // The decoder picks the smallest DCT scale that still covers (w, h).
            decoder.scale(clamp_u16(w), clamp_u16(h))?;
            return DynamicImage::from_decoder(decoder);
        }

        let mut reader = ImageReader::with_format(Cursor::new(data), format);
        reader.limits(self.limits());
        reader.decode()
    }

    /// Format sniffed by the reader rather than the signature table, same limits
    fn decode_direct(&self, data: &[u8]) -> ImageResult<DynamicImage> {
        let mut reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
        reader.limits(self.limits());
        reader.decode()
    }
}

/// Reduce `image` so its longer edge is at most `max`, preserving aspect ratio.
fn fit_within(image: DynamicImage, max: u32) -> Bitmap {
    if image.width().max(image.height()) <= max {
        return Bitmap::from_dynamic(image);
    }
    Bitmap::from_dynamic(image.thumbnail(max, max))
}

/// Dimensions of `(width, height)` scaled so the longer edge equals `max`.
fn fit_dimensions(width: u32, height: u32, max: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max || longest == 0 {
        return (width, height);
    }
    let scale = |edge: u32| -> u32 {
        let scaled = (edge as u64 * max as u64).div_ceil(longest as u64);
        (scaled as u32).max(1)
    };
    (scale(width), scale(height))
}

fn clamp_u16(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ColorType, Rgb, RgbImage, Rgba, RgbaImage};

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([30, 120, 200]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 80)
            .encode(img.as_raw(), width, height, ColorType::Rgb8)
            .unwrap();
        out
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([5, 6, 7, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn downsampler(target: u32, scale: f32) -> Downsampler {
        Downsampler::new(DownsampleConfig {
            target_dimension: target,
            scale_factor: scale,
            ..Default::default()
        })
    }

    #[test]
    fn test_max_pixel_size() {
        assert_eq!(downsampler(300, 2.0).max_pixel_size(), 600);
        assert_eq!(downsampler(300, 3.0).max_pixel_size(), 900);
        assert_eq!(downsampler(100, 1.5).max_pixel_size(), 150);
    }

    #[test]
    fn test_oversized_jpeg_is_bounded() {
        let ds = downsampler(100, 2.0);
        let bitmap = ds.downsample(&jpeg(1600, 1200)).unwrap();

        assert!(bitmap.longest_edge() <= 200, "got {:?}", bitmap.dimensions());
        assert_eq!(bitmap.width(), 200);
        assert_eq!(bitmap.height(), 150);
    }

    #[test]
    fn test_oversized_png_is_bounded() {
        let ds = downsampler(50, 2.0);
        let bitmap = ds.downsample(&png(400, 800)).unwrap();

        assert!(bitmap.longest_edge() <= 100);
        assert_eq!(bitmap.height(), 100);
        assert_eq!(bitmap.width(), 50);
    }

    #[test]
    fn test_decode_alloc_ceiling_is_enforced() {
        let ds = Downsampler::new(DownsampleConfig {
            target_dimension: 25,
            scale_factor: 2.0,
            max_decode_alloc: 1024 * 1024,
        });

        // ~9 MiB once decoded
        assert!(ds.downsample(&png(1500, 1500)).is_none());

        let small = ds.downsample(&png(40, 40)).unwrap();
        assert_eq!(small.dimensions(), (40, 40));
    }

    #[test]
    fn test_small_image_not_upscaled() {
        let ds = downsampler(300, 2.0);
        let bitmap = ds.downsample(&png(40, 30)).unwrap();
        assert_eq!(bitmap.dimensions(), (40, 30));
    }

    #[test]
    fn test_garbage_returns_none() {
        let ds = Downsampler::default();
        assert!(ds.downsample(b"definitely not an image").is_none());
        assert!(ds.downsample(&[]).is_none());
    }

    #[test]
    fn test_truncated_jpeg_returns_none_or_bounded() {
        let ds = downsampler(50, 1.0);
        let data = jpeg(400, 400);
        let truncated = &data[..data.len() / 3];

        if let Some(bitmap) = ds.downsample(truncated) {
            assert!(bitmap.longest_edge() <= 50);
        }
    }

    #[test]
    fn test_fit_dimensions() {
        assert_eq!(fit_dimensions(1000, 500, 100), (100, 50));
        assert_eq!(fit_dimensions(500, 1000, 100), (50, 100));
        assert_eq!(fit_dimensions(80, 40, 100), (80, 40));
        assert_eq!(fit_dimensions(10_000, 1, 100), (100, 1));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        #[test]
        fn prop_longest_edge_within_bound(
            width in 1u32..900,
            height in 1u32..900,
            target in 10u32..120,
            as_jpeg in proptest::bool::ANY,
        ) {
            let ds = downsampler(target, 2.0);
            let data = if as_jpeg { jpeg(width, height) } else { png(width, height) };

            let bitmap = ds.downsample(&data).unwrap();
            proptest::prop_assert!(bitmap.longest_edge() <= target * 2);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(DownsampleConfig::default().validate().is_ok());

        let zero = DownsampleConfig {
            target_dimension: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let negative = DownsampleConfig {
            scale_factor: -1.0,
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }
}
