//! Imaging
//!
//! Decoded bitmap type and the fixed downsampling step applied to every fetched
//! resource before it enters the memory cache.

mod bitmap;
mod downsample;

pub use bitmap::Bitmap;
pub use downsample::{DownsampleConfig, Downsampler};

/// JPEG quality used when persisting downsampled bitmaps to the durable tier
pub const DURABLE_JPEG_QUALITY: u8 = 70;
