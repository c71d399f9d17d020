//! Output container choice and encoding.
//!
//! JPEG and WebP uploads keep their container and filename and are encoded
//! lossy at the configured quality; everything else is written as PNG with
//! the extension forced to `.png`.

use std::borrow::Cow;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage, ImageFormat};
use serde::Serialize;

use hires_core::error::{HiresError, Result};
use hires_core::naming;
use hires_core::types::PixelBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    /// Container implied by the uploaded filename.
    pub fn for_filename(name: &str) -> Self {
        match naming::extension_of(name).as_deref() {
            Some("jpg" | "jpeg") => Self::Jpeg,
            Some("webp") => Self::Webp,
            _ => Self::Png,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputEncoder {
    quality: u8,
}

impl Default for OutputEncoder {
    fn default() -> Self {
        Self { quality: 95 }
    }
}

impl OutputEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Final filename and container for an upload called `original`.
    pub fn output_name(original: &str) -> (String, OutputFormat) {
        let format = OutputFormat::for_filename(original);
        let name = match format {
            OutputFormat::Jpeg | OutputFormat::Webp => original.to_string(),
            OutputFormat::Png => {
                let (stem, _) = naming::split_name(original);
                format!("{stem}.png")
            }
        };
        (name, format)
    }

    pub fn encode(&self, image: &PixelBuffer, original_name: &str) -> Result<EncodedImage> {
        let (filename, format) = Self::output_name(original_name);
        let mut bytes = Vec::new();
        let written = match format {
            OutputFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
                .write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, self.quality)),
            OutputFormat::Webp => {
                bytes = lossy_webp(image, self.quality).map_err(|reason| HiresError::Encode {
                    file: filename.clone(),
                    reason,
                })?;
                Ok(())
            }
            OutputFormat::Png => png_ready(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png),
        };
        written.map_err(|e| HiresError::Encode {
            file: filename.clone(),
            reason: e.to_string(),
        })?;
        Ok(EncodedImage {
            bytes,
            filename,
            format,
        })
    }
}

/// libwebp takes 8-bit RGB(A) only.
fn lossy_webp(image: &DynamicImage, quality: u8) -> std::result::Result<Vec<u8>, String> {
    let (width, height) = (image.width(), image.height());
    let quality = f32::from(quality);
    let encoded = if image.color().has_alpha() {
        let rgba = image.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), width, height).encode_simple(false, quality)
    } else {
        let rgb = image.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), width, height).encode_simple(false, quality)
    };
    encoded
        .map(|memory| memory.to_vec())
        .map_err(|e| format!("webp encoder: {e:?}"))
}

/// PNG carries up to 16 bits per channel; float buffers are narrowed to that.
fn png_ready(image: &DynamicImage) -> Cow<'_, DynamicImage> {
    match image.color() {
        ColorType::Rgb32F => Cow::Owned(DynamicImage::ImageRgb16(image.to_rgb16())),
        ColorType::Rgba32F => Cow::Owned(DynamicImage::ImageRgba16(image.to_rgba16())),
        _ => Cow::Borrowed(image),
    }
}
