use crate::errors::CameraError;
use image::{DynamicImage, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use strum_macros::{EnumString, IntoStaticStr};

/// Memory layout of an uncompressed grab buffer. Only the layouts that can
/// be written to TIFF without interpolation are listed.
#[derive(EnumString, Deserialize, Serialize, IntoStaticStr, Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    /// One byte per pixel, greyscale.
    Mono8,
    /// Three bytes per pixel, packed red, green, blue.
    Rgb8,
}

impl PixelLayout {
    /// Bytes used by one pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Mono8 => 1,
            PixelLayout::Rgb8 => 3,
        }
    }
}

/// Build an image from raw sensor bytes. Trailing padding in `data` is
/// ignored, a short buffer is an error.
///
/// * `width`: image width in pixels.
/// * `height`: image height in pixels.
/// * `layout`: pixel layout of `data`.
/// * `data`: raw bytes, row major without stride padding.
pub fn raw_to_image(
    width: u32,
    height: u32,
    layout: PixelLayout,
    data: &[u8],
) -> Result<DynamicImage, CameraError> {
    let expected = width as usize * height as usize * layout.bytes_per_pixel();
    let pixels = data.get(..expected).ok_or_else(|| {
        CameraError::Conversion(format!(
            "buffer holds {} bytes, {width}x{height} {layout:?} needs {expected}",
            data.len()
        ))
    })?;

    let image = match layout {
        PixelLayout::Mono8 => GrayImage::from_raw(width, height, pixels.to_vec())
            .map(DynamicImage::ImageLuma8),
        PixelLayout::Rgb8 => {
            RgbImage::from_raw(width, height, pixels.to_vec()).map(DynamicImage::ImageRgb8)
        }
    };
    image.ok_or_else(|| CameraError::Conversion("image dimensions rejected".to_string()))
}
