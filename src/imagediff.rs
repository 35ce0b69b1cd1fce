//! Image comparison for checking decompressed output.
//!
//! PSNR is computed over raw channel values on a 0-255 scale: 8-bit images
//! as stored, 16-bit images scaled down, float images (EXR) as-is.

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

/// Images every test material carries, in report order
pub const MATERIAL_IMAGES: [&str; 5] = [
    "AmbientOcclusion",
    "Color",
    "Displacement",
    "NormalDX",
    "Roughness",
];

/// Interleaved samples of one image
struct Samples {
    width: u32,
    height: u32,
    channels: usize,
    data: Vec<f64>,
}

impl Samples {
    fn load(path: &Path) -> Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("Failed to load image: {}", path.display()))?;
        Ok(Self::from_image(img))
    }

    fn from_image(img: DynamicImage) -> Self {
        let (width, height) = (img.width(), img.height());
        let channels = img.color().channel_count() as usize;

        let data = match &img {
            DynamicImage::ImageLuma8(b) => widen(b.as_raw(), 1.0),
            DynamicImage::ImageLumaA8(b) => widen(b.as_raw(), 1.0),
            DynamicImage::ImageRgb8(b) => widen(b.as_raw(), 1.0),
            DynamicImage::ImageRgba8(b) => widen(b.as_raw(), 1.0),
            DynamicImage::ImageLuma16(b) => widen(b.as_raw(), 1.0 / 257.0),
            DynamicImage::ImageLumaA16(b) => widen(b.as_raw(), 1.0 / 257.0),
            DynamicImage::ImageRgb16(b) => widen(b.as_raw(), 1.0 / 257.0),
            DynamicImage::ImageRgba16(b) => widen(b.as_raw(), 1.0 / 257.0),
            DynamicImage::ImageRgb32F(b) => widen(b.as_raw(), 1.0),
            DynamicImage::ImageRgba32F(b) => widen(b.as_raw(), 1.0),
            other => {
                return Self {
                    width,
                    height,
                    channels: 4,
                    data: widen(other.to_rgba8().as_raw(), 1.0),
                }
            }
        };

        Self {
            width,
            height,
            channels,
            data,
        }
    }

    /// Keep only the first `channels` of every pixel
    fn truncate_channels(self, channels: usize) -> Self {
        if channels >= self.channels {
            return self;
        }
        let data = self
            .data
            .chunks_exact(self.channels)
            .flat_map(|px| px[..channels].iter().copied())
            .collect();
        Self {
            channels,
            data,
            ..self
        }
    }
}

fn widen<T: Copy + Into<f64>>(raw: &[T], scale: f64) -> Vec<f64> {
    raw.iter().map(|&v| v.into() * scale).collect()
}

/// PSNR in dB between two images of equal size.
///
/// With `ignore_extra_channels`, `decoded` may have more channels than
/// `reference` and the extras are dropped; otherwise counts must match.
/// Identical images give `f64::INFINITY`.
pub fn compute_psnr(reference: &Path, decoded: &Path, ignore_extra_channels: bool) -> Result<f64> {
    let a = Samples::load(reference)?;
    let b = Samples::load(decoded)?;
    psnr_between(a, b, ignore_extra_channels)
        .with_context(|| format!("Comparing {} with {}", reference.display(), decoded.display()))
}

fn psnr_between(a: Samples, b: Samples, ignore_extra_channels: bool) -> Result<f64> {
    if (a.width, a.height) != (b.width, b.height) {
        bail!(
            "Image sizes differ: {}x{} vs {}x{}",
            a.width,
            a.height,
            b.width,
            b.height
        );
    }

    let b = if ignore_extra_channels {
        if b.channels < a.channels {
            bail!(
                "Decoded image has fewer channels than the reference: {} < {}",
                b.channels,
                a.channels
            );
        }
        b.truncate_channels(a.channels)
    } else {
        if b.channels != a.channels {
            bail!("Channel counts differ: {} vs {}", a.channels, b.channels);
        }
        b
    };

    let sum: f64 = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    let mse = sum / a.data.len().max(1) as f64;

    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (255.0_f64 * 255.0 / mse).log10())
}

/// PSNR of each standard image of a material.
///
/// Originals are `<name>.jpg` in `source_dir`, decoded images are
/// `<name>.tga` in `decoded_dir`. Images are compared in parallel.
pub fn compare_material(
    source_dir: &Path,
    decoded_dir: &Path,
    ignore_extra_channels: bool,
) -> Result<Vec<(&'static str, f64)>> {
    MATERIAL_IMAGES
        .par_iter()
        .map(|&name| -> Result<(&'static str, f64)> {
            let original = source_dir.join(format!("{}.jpg", name));
            let decoded = decoded_dir.join(format!("{}.tga", name));
            if !decoded.exists() {
                bail!("'{}' does not exist", decoded.display());
            }
            let psnr = compute_psnr(&original, &decoded, ignore_extra_channels)?;
            debug!("{}: {:.2} dB", name, psnr);
            Ok((name, psnr))
        })
        .collect()
}
