pub mod rgb_conversion;

use crate::resolution::SubImageRequest;
use image::DynamicImage;
use std::time::Duration;

/// Pixel layout of a decoded tile buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One byte per pixel, luminance
    Gray8,
    /// Four bytes per pixel, interleaved RGBA
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Result of decoding one sub-image request (possibly a progressive pass)
#[derive(Clone)]
pub struct DecodedTile {
    pub request: SubImageRequest,
    pub pixels: Vec<u8>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Fraction of the requested extent/quality delivered so far, 1.0 = complete
    pub coverage: f32,
    pub decode_time: Duration,
}

impl DecodedTile {
    /// Wraps a decoded image. 16-bit luminance is scaled down to 8 bits using the
    /// frame's response factor; everything else that isn't 8-bit gray becomes RGBA.
    pub fn from_image(
        request: SubImageRequest,
        image: DynamicImage,
        response: f32,
        coverage: f32,
        decode_time: Duration,
    ) -> Self {
        let (width, height) = (image.width(), image.height());
        let (pixels, format) = match image {
            DynamicImage::ImageLuma8(gray) => (gray.into_raw(), PixelFormat::Gray8),
            DynamicImage::ImageLuma16(gray) => (
                rgb_conversion::luma16_to_gray8(gray.as_raw(), response),
                PixelFormat::Gray8,
            ),
            DynamicImage::ImageRgb32F(rgb) => (
                rgb_conversion::interleaved_f32_to_rgba8(rgb.as_raw(), 3, width as usize, height as usize),
                PixelFormat::Rgba8,
            ),
            other => (other.to_rgba8().into_raw(), PixelFormat::Rgba8),
        };

        Self {
            request,
            pixels,
            format,
            width,
            height,
            coverage: coverage.clamp(0.0, 1.0),
            decode_time,
        }
    }

    pub fn frame(&self) -> usize {
        self.request.frame
    }

    pub fn level(&self) -> usize {
        self.request.level
    }

    pub fn is_complete(&self) -> bool {
        self.coverage >= 1.0
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for DecodedTile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedTile")
            .field("request", &self.request)
            .field("format", &self.format)
            .field("size", &(self.width, self.height))
            .field("coverage", &self.coverage)
            .finish()
    }
}
