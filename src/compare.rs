//! Side-by-side reconstruction comparison
//!
//! Each evaluated sample gets one image with three panels: the original,
//! the masked input the model saw, and the reconstruction.

use anyhow::{ensure, Context, Result};
use image::imageops;
use image::{GrayImage, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const COMPARISONS_DIR: &str = "comparisons";

/// The masked input as shown to a reader: occluded pixels painted black
pub fn masked_preview(original: &RgbImage, mask: &GrayImage) -> RgbImage {
    let mut preview = original.clone();
    for (x, y, pixel) in preview.enumerate_pixels_mut() {
        if mask.get_pixel(x, y).0[0] > 127 {
            *pixel = Rgb([0, 0, 0]);
        }
    }
    preview
}

/// original | masked | reconstructed
pub fn triptych(original: &RgbImage, masked: &RgbImage, reconstructed: &RgbImage) -> Result<RgbImage> {
    let (w, h) = original.dimensions();
    ensure!(
        masked.dimensions() == (w, h) && reconstructed.dimensions() == (w, h),
        "comparison panels must share one size"
    );
    let mut canvas = RgbImage::new(w * 3, h);
    for (i, panel) in [original, masked, reconstructed].into_iter().enumerate() {
        imageops::replace(&mut canvas, panel, (w * i as u32) as i64, 0);
    }
    Ok(canvas)
}

/// Write `compare_<name>` into `output_dir`
pub fn save_comparison(
    output_dir: &Path,
    name: &str,
    original: &RgbImage,
    mask: &GrayImage,
    reconstructed: &RgbImage,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let panels = triptych(original, &masked_preview(original, mask), reconstructed)?;
    let path = output_dir.join(format!("compare_{name}"));
    panels
        .save(&path)
        .with_context(|| format!("Failed to save {}", path.display()))?;
    debug!(path = %path.display(), "Comparison saved");
    Ok(path)
}
