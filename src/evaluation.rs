//! Evaluation of a trained inpainting model on the test split
//!
//! The evaluator knows nothing about diffusion: it hands each ground-truth
//! image and its mask to an [`Inpainter`] and scores what comes back.

use anyhow::{Context, Result};
use image::{GrayImage, RgbImage};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::compare::{self, COMPARISONS_DIR};
use crate::files;
use crate::masking::{GROUND_TRUTH_DIR, MASKS_DIR};
use crate::metrics;
use crate::progress;

pub const METRICS_CSV: &str = "evaluation_metrics.csv";
pub const SUMMARY_REPORT: &str = "summary_report.txt";

/// Reconstructs the masked region of an image
pub trait Inpainter {
    /// `mask` is set (255) where `image` must be filled in; the result has
    /// the dimensions of `image`
    fn inpaint(&mut self, image: &RgbImage, mask: &GrayImage) -> Result<RgbImage>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleScore {
    pub filename: String,
    pub psnr: f64,
    pub ssim: f64,
    pub masked_psnr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub samples: usize,
    pub failed: usize,
    pub avg_psnr: f64,
    pub avg_ssim: f64,
    pub avg_masked_psnr: Option<f64>,
}

impl EvaluationSummary {
    pub fn from_scores(scores: &[SampleScore], failed: usize) -> Self {
        let n = scores.len() as f64;
        let mean = |f: fn(&SampleScore) -> f64| {
            if scores.is_empty() {
                f64::NAN
            } else {
                scores.iter().map(f).sum::<f64>() / n
            }
        };
        let masked: Vec<f64> = scores.iter().filter_map(|s| s.masked_psnr).collect();
        Self {
            samples: scores.len(),
            failed,
            avg_psnr: mean(|s| s.psnr),
            avg_ssim: mean(|s| s.ssim),
            avg_masked_psnr: (!masked.is_empty()).then(|| masked.iter().sum::<f64>() / masked.len() as f64),
        }
    }
}

pub struct Evaluator {
    test_dir: PathBuf,
    output_dir: PathBuf,
    num_samples: usize,
}

impl Evaluator {
    /// `test_dir` holds `ground_truth/` and `masks/`; `num_samples == 0` evaluates all
    pub fn new(test_dir: &Path, output_dir: &Path, num_samples: usize) -> Self {
        Self {
            test_dir: test_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            num_samples,
        }
    }

    pub fn evaluate<I: Inpainter>(&self, inpainter: &mut I) -> Result<EvaluationSummary> {
        let ground_truth_dir = self.test_dir.join(GROUND_TRUTH_DIR);
        let masks_dir = self.test_dir.join(MASKS_DIR);
        let mut images = files::list_files(&ground_truth_dir, &[".png"])?;
        if self.num_samples > 0 {
            images.truncate(self.num_samples);
        }
        if images.is_empty() {
            warn!(dir = %ground_truth_dir.display(), "No test images found");
        }

        let comparisons_dir = self.output_dir.join(COMPARISONS_DIR);
        std::fs::create_dir_all(&comparisons_dir)
            .with_context(|| format!("Failed to create {}", comparisons_dir.display()))?;

        info!(samples = images.len(), "Evaluating model");
        let mut scores = Vec::with_capacity(images.len());
        let mut failed = 0usize;
        let pb = progress::bar(images.len(), "Evaluating");
        for (i, image_path) in images.iter().enumerate() {
            let name = files::file_name(image_path);
            match self.evaluate_one(inpainter, image_path, &masks_dir.join(&name), &comparisons_dir) {
                Ok(score) => {
                    info!(
                        file = %name,
                        psnr = score.psnr,
                        ssim = score.ssim,
                        progress = format!("{}/{}", i + 1, images.len()),
                        "Sample evaluated"
                    );
                    scores.push(score);
                }
                Err(e) => {
                    failed += 1;
                    error!(file = %name, error = %format!("{e:#}"), "Failed to evaluate sample");
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        let summary = EvaluationSummary::from_scores(&scores, failed);
        if scores.is_empty() {
            warn!(failed, "No samples were evaluated, skipping metrics and summary report");
            return Ok(summary);
        }
        self.write_scores(&scores)?;
        self.write_summary(&summary)?;
        info!(
            samples = summary.samples,
            failed = summary.failed,
            avg_psnr = summary.avg_psnr,
            avg_ssim = summary.avg_ssim,
            "Evaluation complete"
        );
        Ok(summary)
    }

    fn evaluate_one<I: Inpainter>(
        &self,
        inpainter: &mut I,
        image_path: &Path,
        mask_path: &Path,
        comparisons_dir: &Path,
    ) -> Result<SampleScore> {
        let original = image::open(image_path)
            .with_context(|| format!("Failed to load {}", image_path.display()))?
            .to_rgb8();
        let mask = image::open(mask_path)
            .with_context(|| format!("Failed to load mask {}", mask_path.display()))?
            .to_luma8();

        let reconstructed = inpainter.inpaint(&original, &mask)?;
        let name = files::file_name(image_path);
        let score = SampleScore {
            psnr: metrics::psnr(&original, &reconstructed)?,
            ssim: metrics::ssim(&original, &reconstructed)?,
            masked_psnr: metrics::masked_psnr(&original, &reconstructed, &mask)?,
            filename: name.clone(),
        };
        compare::save_comparison(comparisons_dir, &name, &original, &mask, &reconstructed)?;
        Ok(score)
    }

    fn write_scores(&self, scores: &[SampleScore]) -> Result<()> {
        let mut csv = String::from("filename,psnr,ssim,masked_psnr\n");
        for s in scores {
            let masked = s.masked_psnr.map(|v| v.to_string()).unwrap_or_default();
            let _ = writeln!(csv, "{},{},{},{}", s.filename, s.psnr, s.ssim, masked);
        }
        let path = self.output_dir.join(METRICS_CSV);
        std::fs::write(&path, csv).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn write_summary(&self, summary: &EvaluationSummary) -> Result<()> {
        let mut text = String::new();
        let _ = writeln!(text, "Samples: {}", summary.samples);
        let _ = writeln!(text, "Failed: {}", summary.failed);
        let _ = writeln!(text, "Avg PSNR: {:.4}", summary.avg_psnr);
        let _ = writeln!(text, "Avg SSIM: {:.4}", summary.avg_ssim);
        match summary.avg_masked_psnr {
            Some(v) => {
                let _ = writeln!(text, "Avg Masked PSNR: {v:.4}");
            }
            None => text.push_str("Avg Masked PSNR: n/a\n"),
        }
        let path = self.output_dir.join(SUMMARY_REPORT);
        std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Summary report saved");
        Ok(())
    }
}
