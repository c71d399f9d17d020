//! Host-side tensor plumbing around the network call.
//!
//! The network consumes and produces planar `[1, 3, H, W]` float RGB in
//! `[0, 1]`.  Everything here is independent of the inference runtime:
//!
//! - conversion between decoded images and planar RGB,
//! - reflect pre-padding (right/bottom) and its crop after inference,
//! - overlapping tile decomposition and stitching,
//! - rescale from the network's native factor to the requested one,
//! - alpha upscaling and restoration of the input's colour type.

use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, GenericImageView, ImageBuffer, Luma, Rgb, Rgb32FImage, Rgba};
use tracing::trace;

use hires_core::backend::{EnhanceResult, InferenceFault};
use hires_core::types::{EnhanceParams, PixelBuffer};

type AlphaPlane = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Planar (CHW) three-channel float image.
#[derive(Clone, Debug, PartialEq)]
pub struct Planar {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl Planar {
    pub const CHANNELS: usize = 3;

    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; Self::CHANNELS * width as usize * height as usize],
        }
    }

    /// Wrap raw CHW samples.  `None` if the length does not match the dimensions.
    pub fn from_raw(width: u32, height: u32, data: Vec<f32>) -> Option<Self> {
        (data.len() == Self::CHANNELS * width as usize * height as usize).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<f32> {
        self.data
    }

    fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn index(&self, channel: usize, x: u32, y: u32) -> usize {
        channel * self.plane_len() + y as usize * self.width as usize + x as usize
    }

    pub fn get(&self, channel: usize, x: u32, y: u32) -> f32 {
        self.data[self.index(channel, x, y)]
    }

    pub fn from_rgb(image: &Rgb32FImage) -> Self {
        let (width, height) = image.dimensions();
        let mut planar = Self::zeros(width, height);
        let plane = planar.plane_len();
        for (i, pixel) in image.pixels().enumerate() {
            for c in 0..Self::CHANNELS {
                planar.data[c * plane + i] = pixel.0[c];
            }
        }
        planar
    }

    /// Interleave back into an RGB image, clamping to `[0, 1]`.
    pub fn to_rgb(&self) -> Rgb32FImage {
        let plane = self.plane_len();
        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            let i = y as usize * self.width as usize + x as usize;
            Rgb([
                self.data[i].clamp(0.0, 1.0),
                self.data[plane + i].clamp(0.0, 1.0),
                self.data[2 * plane + i].clamp(0.0, 1.0),
            ])
        })
    }

    /// Copy out the `width` x `height` window at `(x, y)`.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Self {
        let mut out = Self::zeros(width, height);
        out.blit(self, x, y, width, height, 0, 0);
        out
    }

    /// Extend right and bottom edges by mirror reflection (edge sample not repeated).
    pub fn pad_reflect(&self, right: u32, bottom: u32) -> Self {
        let mut out = Self::zeros(self.width + right, self.height + bottom);
        for c in 0..Self::CHANNELS {
            for y in 0..out.height {
                let sy = reflect(y, self.height);
                for x in 0..out.width {
                    let sx = reflect(x, self.width);
                    let dst = out.index(c, x, y);
                    out.data[dst] = self.get(c, sx, sy);
                }
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn blit(
        &mut self,
        src: &Planar,
        src_x: u32,
        src_y: u32,
        width: u32,
        height: u32,
        dst_x: u32,
        dst_y: u32,
    ) {
        let row = width as usize;
        for c in 0..Self::CHANNELS {
            for dy in 0..height {
                let from = src.index(c, src_x, src_y + dy);
                let to = self.index(c, dst_x, dst_y + dy);
                self.data[to..to + row].copy_from_slice(&src.data[from..from + row]);
            }
        }
    }
}

fn reflect(i: u32, len: u32) -> u32 {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i % period;
    if m < len { m } else { period - m }
}

// ─── Tiling ──────────────────────────────────────────────────────────────────

/// One tile: the core area it contributes plus the padded area fed to the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub pad_width: u32,
    pub pad_height: u32,
}

/// Row-major tile decomposition of a `width` x `height` image.
///
/// Core areas partition the image; padded areas extend each core by up to
/// `tile_pad` pixels, clipped to the image bounds.  `tile == 0` yields a
/// single region covering everything.
pub fn tile_regions(width: u32, height: u32, tile: u32, tile_pad: u32) -> Vec<TileRegion> {
    if tile == 0 {
        return vec![TileRegion {
            x: 0,
            y: 0,
            width,
            height,
            pad_x: 0,
            pad_y: 0,
            pad_width: width,
            pad_height: height,
        }];
    }

    let mut regions = Vec::new();
    for ty in 0..height.div_ceil(tile) {
        for tx in 0..width.div_ceil(tile) {
            let x = tx * tile;
            let y = ty * tile;
            let x_end = (x + tile).min(width);
            let y_end = (y + tile).min(height);
            let pad_x = x.saturating_sub(tile_pad);
            let pad_y = y.saturating_sub(tile_pad);
            regions.push(TileRegion {
                x,
                y,
                width: x_end - x,
                height: y_end - y,
                pad_x,
                pad_y,
                pad_width: (x_end + tile_pad).min(width) - pad_x,
                pad_height: (y_end + tile_pad).min(height) - pad_y,
            });
        }
    }
    regions
}

fn check_scaled(input: &Planar, output: &Planar, scale: u32) -> Result<(), InferenceFault> {
    let expected = (input.width * scale, input.height * scale);
    if (output.width, output.height) == expected {
        Ok(())
    } else {
        Err(InferenceFault::Failed(format!(
            "network returned {}x{} for a {}x{} input (expected {}x{})",
            output.width, output.height, input.width, input.height, expected.0, expected.1
        )))
    }
}

/// Run `infer` over `input`, whole or tile by tile, and stitch a `scale`x result.
///
/// The first failing tile aborts the run.
pub fn run_tiled<F>(
    input: &Planar,
    tile: u32,
    tile_pad: u32,
    scale: u32,
    mut infer: F,
) -> Result<Planar, InferenceFault>
where
    F: FnMut(&Planar) -> Result<Planar, InferenceFault>,
{
    if tile == 0 {
        let output = infer(input)?;
        check_scaled(input, &output, scale)?;
        return Ok(output);
    }

    let regions = tile_regions(input.width, input.height, tile, tile_pad);
    let total = regions.len();
    let mut output = Planar::zeros(input.width * scale, input.height * scale);
    for (i, region) in regions.into_iter().enumerate() {
        trace!(tile = i + 1, total, ?region, "Inferring tile");
        let patch = input.crop(region.pad_x, region.pad_y, region.pad_width, region.pad_height);
        let upscaled = infer(&patch)?;
        check_scaled(&patch, &upscaled, scale)?;
        output.blit(
            &upscaled,
            (region.x - region.pad_x) * scale,
            (region.y - region.pad_y) * scale,
            region.width * scale,
            region.height * scale,
            region.x * scale,
            region.y * scale,
        );
    }
    Ok(output)
}

// ─── Whole-image driver ──────────────────────────────────────────────────────

/// Upscale `input` to `params.outscale` using a network of `native_scale`.
///
/// Colour type is preserved: grayscale stays grayscale, alpha is carried
/// through a bicubic resize, and 16-bit or float inputs keep their depth.
pub fn enhance_image<F>(
    input: &PixelBuffer,
    params: &EnhanceParams,
    native_scale: u32,
    infer: F,
) -> EnhanceResult
where
    F: FnMut(&Planar) -> Result<Planar, InferenceFault>,
{
    let (width, height) = input.dimensions();
    if width == 0 || height == 0 {
        return Err(InferenceFault::Failed("image has no pixels".into()));
    }

    let mut planar = Planar::from_rgb(&input.to_rgb32f());
    if params.pre_pad > 0 {
        planar = planar.pad_reflect(params.pre_pad, params.pre_pad);
    }

    let mut upscaled = run_tiled(&planar, params.tile, params.tile_pad, native_scale, infer)?;
    if params.pre_pad > 0 {
        upscaled = upscaled.crop(0, 0, width * native_scale, height * native_scale);
    }

    let (out_w, out_h) = (width * params.outscale, height * params.outscale);
    let mut rgb = upscaled.to_rgb();
    if params.outscale != native_scale {
        rgb = imageops::resize(&rgb, out_w, out_h, FilterType::Lanczos3);
        clamp_unit(&mut rgb);
    }

    let alpha = input
        .color()
        .has_alpha()
        .then(|| upscale_alpha(input, out_w, out_h));
    Ok(assemble(rgb, alpha, input.color()))
}

fn clamp_unit(image: &mut Rgb32FImage) {
    image.iter_mut().for_each(|v| *v = v.clamp(0.0, 1.0));
}

fn upscale_alpha(input: &DynamicImage, width: u32, height: u32) -> AlphaPlane {
    let rgba = input.to_rgba32f();
    let alpha: AlphaPlane =
        ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| Luma([rgba.get_pixel(x, y).0[3]]));
    let mut resized = imageops::resize(&alpha, width, height, FilterType::CatmullRom);
    resized.iter_mut().for_each(|v| *v = v.clamp(0.0, 1.0));
    resized
}

fn assemble(rgb: Rgb32FImage, alpha: Option<AlphaPlane>, like: ColorType) -> DynamicImage {
    let base = match alpha {
        Some(alpha) => DynamicImage::ImageRgba32F(ImageBuffer::from_fn(
            rgb.width(),
            rgb.height(),
            |x, y| {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                Rgba([r, g, b, alpha.get_pixel(x, y).0[0]])
            },
        )),
        None => DynamicImage::ImageRgb32F(rgb),
    };

    match like {
        ColorType::L8 => DynamicImage::ImageLuma8(base.to_luma8()),
        ColorType::La8 => DynamicImage::ImageLumaA8(base.to_luma_alpha8()),
        ColorType::Rgb8 => DynamicImage::ImageRgb8(base.to_rgb8()),
        ColorType::Rgba8 => DynamicImage::ImageRgba8(base.to_rgba8()),
        ColorType::L16 => DynamicImage::ImageLuma16(base.to_luma16()),
        ColorType::La16 => DynamicImage::ImageLumaA16(base.to_luma_alpha16()),
        ColorType::Rgb16 => DynamicImage::ImageRgb16(base.to_rgb16()),
        ColorType::Rgba16 => DynamicImage::ImageRgba16(base.to_rgba16()),
        ColorType::Rgb32F | ColorType::Rgba32F => base,
        _ if like.has_alpha() => DynamicImage::ImageRgba8(base.to_rgba8()),
        _ => DynamicImage::ImageRgb8(base.to_rgb8()),
    }
}
