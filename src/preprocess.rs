//! Letterboxing of arbitrary images into the fixed RGB input a variant expects.

use crate::error::{Result, VlmError};
use crate::models::ImageSize;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};

/// Interleaved RGB bytes, row-major, three bytes per pixel, no padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgbTensor {
    pub size: ImageSize,
    pub data: Vec<u8>,
}

impl RgbTensor {
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.size.rgb_len()
    }
}

/// Decodes `bytes` (any format the `image` crate understands) and letterboxes
/// it into `target`.
pub fn preprocess(bytes: &[u8], target: ImageSize) -> Result<RgbTensor> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| VlmError::ImageProcessingError(format!("cannot decode image: {}", e)))?;
    preprocess_image(&image, target)
}

/// Scales `image` uniformly so it fits `target`, then centers it on a black
/// canvas of exactly `target`. Alpha is composited onto black first.
pub fn preprocess_image(image: &DynamicImage, target: ImageSize) -> Result<RgbTensor> {
    let (src_w, src_h) = (image.width(), image.height());
    if src_w == 0 || src_h == 0 {
        return Err(VlmError::ImageProcessingError(
            "source image is zero-sized".to_string(),
        ));
    }
    if target.width == 0 || target.height == 0 {
        return Err(VlmError::ImageProcessingError(
            "target size is zero-sized".to_string(),
        ));
    }

    let flattened = flatten_onto_black(image);
    let (new_w, new_h) = scaled_dimensions(src_w, src_h, target);
    let scaled = if (new_w, new_h) == (src_w, src_h) {
        flattened
    } else {
        imageops::resize(&flattened, new_w, new_h, FilterType::Triangle)
    };

    let mut canvas = RgbImage::from_pixel(target.width, target.height, Rgb([0, 0, 0]));
    let x = (target.width - new_w) / 2;
    let y = (target.height - new_h) / 2;
    imageops::replace(&mut canvas, &scaled, i64::from(x), i64::from(y));

    Ok(RgbTensor {
        size: target,
        data: canvas.into_raw(),
    })
}

/// `min(tw / sw, th / sh)` applied to both axes, rounded and clamped so the
/// result is at least one pixel and never exceeds the target.
fn scaled_dimensions(src_w: u32, src_h: u32, target: ImageSize) -> (u32, u32) {
    let scale = f64::min(
        f64::from(target.width) / f64::from(src_w),
        f64::from(target.height) / f64::from(src_h),
    );
    let w = (f64::from(src_w) * scale).round() as u32;
    let h = (f64::from(src_h) * scale).round() as u32;
    (w.clamp(1, target.width), h.clamp(1, target.height))
}

fn flatten_onto_black(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in rgb.pixels_mut().zip(rgba.pixels()) {
        let [r, g, b, a] = src.0;
        let blend = |c: u8| ((u16::from(c) * u16::from(a) + 127) / 255) as u8;
        *dst = Rgb([blend(r), blend(g), blend(b)]);
    }
    rgb
}
