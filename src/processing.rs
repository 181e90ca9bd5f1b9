//! Normalises raw downloads into a fixed-size RGB corpus

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::ImageFormat;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::files;
use crate::progress;

const INPUT_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".bmp", ".gif"];

/// Outcome of one processing run; `processed_count + error_count == total_found`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingSummary {
    pub processed_count: usize,
    pub error_count: usize,
    pub total_found: usize,
}

pub struct ImageProcessor {
    input_dir: PathBuf,
    output_dir: PathBuf,
    width: u32,
    height: u32,
    format: ImageFormat,
    extension: &'static str,
}

impl ImageProcessor {
    pub fn new(input_dir: &Path, output_dir: &Path, image_size: [u32; 2], output_format: &str) -> Result<Self> {
        let (format, extension) = parse_format(output_format)?;
        Ok(Self {
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            width: image_size[0],
            height: image_size[1],
            format,
            extension,
        })
    }

    /// Resize every image to the target size, convert to RGB and re-encode
    pub fn process_images(&self) -> Result<ProcessingSummary> {
        let image_files = files::list_files(&self.input_dir, INPUT_EXTENSIONS)?;
        info!(count = image_files.len(), dir = %self.input_dir.display(), "Found image files");

        if image_files.is_empty() {
            warn!("No images found in the input directory. Nothing to process.");
            return Ok(ProcessingSummary::default());
        }

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        info!(
            size = format!("{}x{}", self.width, self.height),
            format = ?self.format,
            "Processing images"
        );

        let mut summary = ProcessingSummary {
            total_found: image_files.len(),
            ..Default::default()
        };
        let mut taken = HashSet::new();
        let pb = progress::bar(image_files.len(), "Processing");
        for path in &image_files {
            let output_name = self.output_name(path, &mut taken);
            match self.process_one(path, &output_name) {
                Ok(_) => summary.processed_count += 1,
                Err(e) => {
                    summary.error_count += 1;
                    error!(file = %path.display(), error = %format!("{e:#}"), "Failed to process image");
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            processed = summary.processed_count,
            errors = summary.error_count,
            total = summary.total_found,
            "Image processing complete"
        );
        Ok(summary)
    }

    /// `<stem>.<ext>`, or `<stem>_<source ext>[_n].<ext>` when an earlier
    /// input in this run already claimed that name
    fn output_name(&self, path: &Path, taken: &mut HashSet<String>) -> String {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let preferred = format!("{stem}.{}", self.extension);
        if taken.insert(preferred.clone()) {
            return preferred;
        }

        let source_ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let base = format!("{stem}_{source_ext}");
        let mut name = format!("{base}.{}", self.extension);
        let mut n = 1;
        while !taken.insert(name.clone()) {
            name = format!("{base}_{n}.{}", self.extension);
            n += 1;
        }
        warn!(file = %path.display(), output = %name, "Output name already used, renaming");
        name
    }

    fn process_one(&self, path: &Path, output_name: &str) -> Result<PathBuf> {
        let img = image::open(path).with_context(|| format!("Failed to decode {}", path.display()))?;
        let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
        let resized = rgb.resize_exact(self.width, self.height, FilterType::Lanczos3);

        let output_path = self.output_dir.join(output_name);
        resized
            .save_with_format(&output_path, self.format)
            .with_context(|| format!("Failed to save {}", output_path.display()))?;
        Ok(output_path)
    }
}

fn parse_format(name: &str) -> Result<(ImageFormat, &'static str)> {
    match name.to_ascii_lowercase().as_str() {
        "png" => Ok((ImageFormat::Png, "png")),
        "jpg" | "jpeg" => Ok((ImageFormat::Jpeg, "jpg")),
        "bmp" => Ok((ImageFormat::Bmp, "bmp")),
        other => bail!("Unsupported output format: {other}"),
    }
}
