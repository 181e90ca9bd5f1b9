//! Synthetic occlusion masks and the paired inpainting dataset
//!
//! For each image of a split the stage writes two files with the same name:
//!
//! ```text
//! <split>/ground_truth/<name>.png   unmodified copy of the input
//! <split>/masks/<name>.png          single-channel mask, 255 = occluded
//! ```
//!
//! Both files are staged under temporary names and renamed only after both
//! exist, so a failed sample leaves neither behind.

use anyhow::{bail, Context, Result};
use image::{GrayImage, Luma};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::MaskConfig;
use crate::{files, progress};

pub const GROUND_TRUTH_DIR: &str = "ground_truth";
pub const MASKS_DIR: &str = "masks";

/// Known mask generation strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskStrategy {
    RandomRectangle,
}

impl MaskStrategy {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "random_rectangle" => Ok(Self::RandomRectangle),
            other => bail!("Unknown masking strategy: {other}"),
        }
    }
}

/// Occluded rectangle in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl MaskRect {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.left + self.width && y >= self.top && y < self.top + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Counts reported after one split has been masked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskingSummary {
    pub generated: usize,
    pub failed: usize,
}

/// Generates masks and assembles the paired dataset for one or more splits
pub struct MaskGenerator {
    strategy: MaskStrategy,
    config: MaskConfig,
    seed: u64,
}

impl MaskGenerator {
    pub fn new(strategy: MaskStrategy, config: MaskConfig, seed: u64) -> Self {
        Self {
            strategy,
            config,
            seed,
        }
    }

    /// Deterministic per-sample RNG: the run seed mixed with the file name
    pub fn rng_for(&self, file_name: &str) -> Pcg64 {
        Pcg64::seed_from_u64(self.seed ^ fnv1a(file_name.as_bytes()))
    }

    /// Draw a mask of `width` × `height` pixels
    pub fn generate<R: Rng>(&self, width: u32, height: u32, rng: &mut R) -> (GrayImage, MaskRect) {
        match self.strategy {
            MaskStrategy::RandomRectangle => random_rectangle(width, height, &self.config, rng),
        }
    }

    /// Build `output_dir/{ground_truth,masks}` from the PNGs in `image_dir`
    ///
    /// Per-image failures are logged and skipped.
    pub fn create_inpainting_dataset(&self, image_dir: &Path, output_dir: &Path) -> Result<MaskingSummary> {
        let image_files = files::list_files(image_dir, &[".png"])?;
        let split = files::file_name(image_dir);

        if image_files.is_empty() {
            warn!(dir = %image_dir.display(), "No PNG images found. Nothing to process.");
            return Ok(MaskingSummary::default());
        }

        let ground_truth_dir = output_dir.join(GROUND_TRUTH_DIR);
        let masks_dir = output_dir.join(MASKS_DIR);
        std::fs::create_dir_all(&ground_truth_dir)
            .with_context(|| format!("Failed to create {}", ground_truth_dir.display()))?;
        std::fs::create_dir_all(&masks_dir)
            .with_context(|| format!("Failed to create {}", masks_dir.display()))?;

        info!(split = %split, count = image_files.len(), "Generating masks");

        let mut summary = MaskingSummary::default();
        let pb = progress::bar(image_files.len(), "Masking");
        for (i, image_path) in image_files.iter().enumerate() {
            match self.write_pair(image_path, &ground_truth_dir, &masks_dir) {
                Ok(rect) => {
                    summary.generated += 1;
                    debug!(file = %image_path.display(), ?rect, "Mask written");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(file = %image_path.display(), error = %format!("{e:#}"), "Failed to generate mask");
                }
            }
            pb.inc(1);
            if (i + 1) % 100 == 0 || i + 1 == image_files.len() {
                info!(split = %split, done = i + 1, total = image_files.len(), "Masking progress");
            }
        }
        pb.finish_and_clear();

        info!(
            split = %split,
            generated = summary.generated,
            failed = summary.failed,
            "Finished generating masks"
        );
        Ok(summary)
    }

    fn write_pair(&self, image_path: &Path, ground_truth_dir: &Path, masks_dir: &Path) -> Result<MaskRect> {
        let name = files::file_name(image_path);
        let (width, height) = image::image_dimensions(image_path)
            .with_context(|| format!("Failed to read image: {}", image_path.display()))?;

        let mut rng = self.rng_for(&name);
        let (mask, rect) = self.generate(width, height, &mut rng);

        let staged_truth = staging_path(ground_truth_dir, &name);
        let staged_mask = staging_path(masks_dir, &name);

        let staged = (|| -> Result<()> {
            std::fs::copy(image_path, &staged_truth)
                .with_context(|| format!("Failed to copy {}", image_path.display()))?;
            mask.save_with_format(&staged_mask, image::ImageFormat::Png)
                .with_context(|| format!("Failed to save mask {}", staged_mask.display()))?;
            std::fs::rename(&staged_mask, masks_dir.join(&name))?;
            std::fs::rename(&staged_truth, ground_truth_dir.join(&name))?;
            Ok(())
        })();

        if let Err(e) = staged {
            for path in [&staged_truth, &staged_mask] {
                let _ = std::fs::remove_file(path);
            }
            // A mask renamed without its ground truth would be an orphan.
            if !ground_truth_dir.join(&name).exists() {
                let _ = std::fs::remove_file(masks_dir.join(&name));
            }
            return Err(e);
        }
        Ok(rect)
    }
}

/// One axis-aligned rectangle with each side drawn from
/// `[ceil(min * side), floor(max * side)]`, placed uniformly inside the image
pub fn random_rectangle<R: Rng>(
    width: u32,
    height: u32,
    config: &MaskConfig,
    rng: &mut R,
) -> (GrayImage, MaskRect) {
    let rect_height = draw_side(height, config, rng);
    let rect_width = draw_side(width, config, rng);
    let top = rng.gen_range(0..=height - rect_height);
    let left = rng.gen_range(0..=width - rect_width);
    let rect = MaskRect {
        left,
        top,
        width: rect_width,
        height: rect_height,
    };

    let mask = GrayImage::from_fn(width, height, |x, y| {
        if rect.contains(x, y) {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    (mask, rect)
}

/// Side length within `[min_ratio, max_ratio] * side`, at least one pixel.
/// When no integer fits the range the lower bound wins.
fn draw_side<R: Rng>(side: u32, config: &MaskConfig, rng: &mut R) -> u32 {
    let side_f = side as f64;
    let lo = ((config.min_mask_size_ratio * side_f - 1e-9).ceil() as u32).clamp(1, side.max(1));
    let hi = ((config.max_mask_size_ratio * side_f + 1e-9).floor() as u32).min(side);
    let hi = hi.max(lo);
    rng.gen_range(lo..=hi)
}

fn staging_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{name}.partial"))
}

/// 64-bit FNV-1a, stable across platforms and releases
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
