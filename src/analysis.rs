//! Exploratory analysis of the raw image corpus
//!
//! Collects per-image metadata, writes it as CSV together with descriptive
//! statistics, and renders the distribution charts from [`crate::plot`].

use anyhow::{Context, Result};
use image::{ColorType, ImageReader};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::files;
use crate::plot;
use crate::progress;

pub const METADATA_CSV: &str = "full_image_metadata.csv";
pub const SUMMARY_FILE: &str = "summary_statistics.txt";
const HISTOGRAM_BINS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub mode: String,
    pub filesize_kb: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub analyzed: usize,
    pub error_count: usize,
    pub total_found: usize,
}

/// Descriptive statistics of one numeric column
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

impl ColumnStats {
    /// `None` for an empty column; `std` is the sample deviation (n - 1)
    pub fn describe(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let std = if n > 1 {
            (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        Some(Self {
            count: n,
            mean,
            std,
            min: sorted[0],
            q25: quantile(&sorted, 0.25),
            median: quantile(&sorted, 0.5),
            q75: quantile(&sorted, 0.75),
            max: sorted[n - 1],
        })
    }
}

// Linear interpolation between closest ranks.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

pub struct ExploratoryDataAnalyzer {
    input_dir: PathBuf,
    output_dir: PathBuf,
    extensions: Vec<String>,
}

impl ExploratoryDataAnalyzer {
    pub fn new(input_dir: &Path, output_dir: &Path, extensions: &[String]) -> Self {
        Self {
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            extensions: extensions.to_vec(),
        }
    }

    pub fn run(&self) -> Result<AnalysisSummary> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let extensions: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
        let image_files = files::list_files_recursive(&self.input_dir, &extensions)?;
        info!(count = image_files.len(), dir = %self.input_dir.display(), "Found image files");
        if image_files.is_empty() {
            warn!("No image files found. EDA concluded.");
            return Ok(AnalysisSummary::default());
        }

        let mut summary = AnalysisSummary {
            total_found: image_files.len(),
            ..Default::default()
        };
        let mut records = Vec::with_capacity(image_files.len());
        let pb = progress::bar(image_files.len(), "Analyzing");
        for path in &image_files {
            match analyze_image(path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    summary.error_count += 1;
                    warn!(file = %path.display(), error = %format!("{e:#}"), "Could not analyze image");
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        summary.analyzed = records.len();

        if records.is_empty() {
            warn!("No readable images. Skipping summary and visualizations.");
            return Ok(summary);
        }

        self.write_metadata(&records)?;
        self.write_summary(&records)?;
        self.write_visualizations(&records)?;
        info!(
            analyzed = summary.analyzed,
            errors = summary.error_count,
            dir = %self.output_dir.display(),
            "EDA complete"
        );
        Ok(summary)
    }

    fn write_metadata(&self, records: &[ImageMetadata]) -> Result<()> {
        let mut csv = String::from("filename,width,height,aspect_ratio,mode,filesize_kb\n");
        for r in records {
            let _ = writeln!(
                csv,
                "{},{},{},{},{},{}",
                csv_field(&r.filename),
                r.width,
                r.height,
                r.aspect_ratio,
                r.mode,
                r.filesize_kb
            );
        }
        let path = self.output_dir.join(METADATA_CSV);
        std::fs::write(&path, csv).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Full metadata saved");
        Ok(())
    }

    fn write_summary(&self, records: &[ImageMetadata]) -> Result<()> {
        let columns: [(&str, Vec<f64>); 4] = [
            ("width", records.iter().map(|r| r.width as f64).collect()),
            ("height", records.iter().map(|r| r.height as f64).collect()),
            ("aspect_ratio", records.iter().map(|r| r.aspect_ratio).collect()),
            ("filesize_kb", records.iter().map(|r| r.filesize_kb).collect()),
        ];

        let mut text = format!("Total Images Analyzed: {}\n\n", records.len());
        let _ = writeln!(
            text,
            "{:<14}{:>8}{:>12}{:>12}{:>12}{:>12}{:>12}{:>12}{:>12}",
            "", "count", "mean", "std", "min", "25%", "50%", "75%", "max"
        );
        for (name, values) in &columns {
            if let Some(s) = ColumnStats::describe(values) {
                let _ = writeln!(
                    text,
                    "{:<14}{:>8}{:>12.3}{:>12.3}{:>12.3}{:>12.3}{:>12.3}{:>12.3}{:>12.3}",
                    name, s.count, s.mean, s.std, s.min, s.q25, s.median, s.q75, s.max
                );
            }
        }

        text.push_str("\nFile formats:\n");
        for (ext, count) in extension_counts(records) {
            let share = 100.0 * count as f64 / records.len() as f64;
            let _ = writeln!(text, "  {ext:<8}{count:>6}  ({share:.1}%)");
        }

        let path = self.output_dir.join(SUMMARY_FILE);
        std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Summary statistics saved");
        Ok(())
    }

    fn write_visualizations(&self, records: &[ImageMetadata]) -> Result<()> {
        let widths: Vec<f64> = records.iter().map(|r| r.width as f64).collect();
        let heights: Vec<f64> = records.iter().map(|r| r.height as f64).collect();
        let points: Vec<(f64, f64)> = widths.iter().copied().zip(heights.iter().copied()).collect();
        let formats: Vec<(String, usize)> = extension_counts(records)
            .into_iter()
            .map(|(ext, count)| (ext.trim_start_matches('.').to_string(), count))
            .collect();

        let count_of = |x| plot::AxisLabels { x, y: "Count" };
        let dimensions = plot::AxisLabels {
            x: "Width (px)",
            y: "Height (px)",
        };
        let charts = [
            (
                "width_distribution.png",
                plot::histogram(&widths, HISTOGRAM_BINS, plot::SKY_BLUE, count_of("Width (px)"), 1200, 600),
            ),
            (
                "height_distribution.png",
                plot::histogram(&heights, HISTOGRAM_BINS, plot::SALMON, count_of("Height (px)"), 1200, 600),
            ),
            ("dimensions_scatter_plot.png", plot::scatter(&points, plot::STEEL, dimensions, 1000, 1000)),
            ("file_format_distribution.png", plot::pie_chart(&formats, 1000, 700)),
        ];
        for (name, chart) in charts {
            let path = self.output_dir.join(name);
            chart
                .save(&path)
                .with_context(|| format!("Failed to save {}", path.display()))?;
        }
        info!(dir = %self.output_dir.display(), "All visualizations saved");
        Ok(())
    }
}

pub fn analyze_image(path: &Path) -> Result<ImageMetadata> {
    let img = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    let (width, height) = (img.width(), img.height());
    let filesize = std::fs::metadata(path)?.len();
    Ok(ImageMetadata {
        filename: files::file_name(path),
        width,
        height,
        aspect_ratio: if height > 0 { width as f64 / height as f64 } else { 0.0 },
        mode: color_mode(img.color()),
        filesize_kb: filesize as f64 / 1024.0,
    })
}

fn color_mode(color: ColorType) -> String {
    match color {
        ColorType::L8 | ColorType::L16 => "L".to_string(),
        ColorType::La8 | ColorType::La16 => "LA".to_string(),
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB".to_string(),
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA".to_string(),
        other => format!("{other:?}"),
    }
}

fn extension_counts(records: &[ImageMetadata]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for r in records {
        let ext = files::dotted_extension(Path::new(&r.filename)).unwrap_or_default();
        *counts.entry(ext).or_insert(0) += 1;
    }
    counts
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    #[test]
    fn test_describe_matches_hand_computed_values() {
        let stats = ColumnStats::describe(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean, 2.5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.median, 2.5);
        assert_eq!(stats.q25, 1.75);
        assert!((stats.std - 1.290_994).abs() < 1e-5);
        assert!(ColumnStats::describe(&[]).is_none());
    }

    #[test]
    fn test_csv_field_quotes_commas() {
        assert_eq!(csv_field("plain.png"), "plain.png");
        assert_eq!(csv_field("a,b.png"), "\"a,b.png\"");
    }

    #[test]
    fn test_five_images_with_one_corrupted() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let nested = input.path().join("sub");
        std::fs::create_dir_all(&nested).unwrap();

        RgbImage::from_pixel(40, 20, Rgb([1, 2, 3])).save(input.path().join("a.png")).unwrap();
        RgbImage::from_pixel(30, 30, Rgb([1, 2, 3])).save(input.path().join("b.jpg")).unwrap();
        GrayImage::from_pixel(10, 50, Luma([9])).save(input.path().join("c.png")).unwrap();
        RgbImage::from_pixel(64, 48, Rgb([7, 7, 7])).save(nested.join("d.jpg")).unwrap();
        std::fs::write(input.path().join("e.png"), b"not an image").unwrap();
        std::fs::write(input.path().join("notes.txt"), b"ignored").unwrap();

        let extensions = vec![".png".to_string(), ".jpg".to_string()];
        let summary = ExploratoryDataAnalyzer::new(input.path(), output.path(), &extensions)
            .run()
            .unwrap();

        assert_eq!(summary.total_found, 5);
        assert_eq!(summary.analyzed, 4);
        assert_eq!(summary.error_count, 1);

        let csv = std::fs::read_to_string(output.path().join(METADATA_CSV)).unwrap();
        assert_eq!(csv.lines().count(), 5);
        assert!(csv.contains("c.png,10,50,0.2,L,"));

        let report = std::fs::read_to_string(output.path().join(SUMMARY_FILE)).unwrap();
        assert!(report.starts_with("Total Images Analyzed: 4"));
        for chart in [
            "width_distribution.png",
            "height_distribution.png",
            "dimensions_scatter_plot.png",
            "file_format_distribution.png",
        ] {
            assert!(output.path().join(chart).is_file(), "{chart} missing");
        }
    }
}
