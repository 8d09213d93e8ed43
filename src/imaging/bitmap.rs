//! Decoded bitmap handle

use std::fmt;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, RgbaImage};

use crate::error::Result;

/// Bytes per RGBA8 pixel
const BYTES_PER_PIXEL: u64 = 4;

/// Decoded RGBA8 bitmap.
///
/// Clones share the pixel buffer, so a bitmap handed to a caller stays valid after the
/// memory cache evicts its entry.
#[derive(Clone)]
pub struct Bitmap {
    pixels: Arc<RgbaImage>,
}

impl Bitmap {
    pub fn new(pixels: RgbaImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
        }
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self::new(image.into_rgba8())
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Length of the longer edge in pixels
    pub fn longest_edge(&self) -> u32 {
        self.width().max(self.height())
    }

    /// Bytes per row of pixel data
    pub fn row_stride(&self) -> u64 {
        self.width() as u64 * BYTES_PER_PIXEL
    }

    /// Estimated memory cost: row stride times height
    pub fn byte_cost(&self) -> u64 {
        self.row_stride() * self.height() as u64
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// True if both handles share the same pixel buffer
    pub fn ptr_eq(a: &Bitmap, b: &Bitmap) -> bool {
        Arc::ptr_eq(&a.pixels, &b.pixels)
    }

    /// Encode as JPEG for the durable tier. Alpha is dropped.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let rgb = DynamicImage::ImageRgba8((*self.pixels).clone()).into_rgb8();
        let mut out = Vec::with_capacity(self.byte_cost() as usize / 8);
        JpegEncoder::new_with_quality(&mut out, quality).encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ColorType::Rgb8,
        )?;
        Ok(out)
    }
}

impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        Bitmap::ptr_eq(self, other)
            || (self.dimensions() == other.dimensions()
                && self.pixels.as_raw() == other.pixels.as_raw())
    }
}

impl Eq for Bitmap {}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("cost", &self.byte_cost())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
