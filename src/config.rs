//! Typed pipeline configuration
//!
//! The whole run is described by one YAML document with a section per stage.
//! It is parsed once at start-up into [`PipelineConfig`], validated, and then
//! handed to every stage by shared reference. Nothing mutates it afterwards.
//!
//! ```yaml
//! global_params:
//!   seed: 42
//!   num_epochs: 10
//! data_paths:
//!   raw_images: artifacts/raw_images
//!   # ...
//! ```
//!
//! A missing section or field fails at load time with the offending path in
//! the error message, so a typo never surfaces halfway through training.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Complete configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub global_params: GlobalParams,
    pub data_paths: DataPaths,
    pub logging: LoggingConfig,
    pub data_acquisition: DataAcquisitionConfig,
    pub exploratory_data_analysis: EdaConfig,
    pub data_processing: DataProcessingConfig,
    pub data_splitting: DataSplittingConfig,
    pub feature_engineering: FeatureEngineeringConfig,
    pub hyperparameter_tuning: HyperparameterTuningConfig,
    pub training: TrainingConfig,
    pub model_evaluation: ModelEvaluationConfig,
    pub deployment_preparation: DeploymentPreparationConfig,
}

/// Parameters shared by several stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalParams {
    #[serde(default = "default_project_name")]
    pub project_name: String,

    /// Seed for splitting, mask generation, batching and noise sampling
    pub seed: u64,

    /// Number of full passes over the training split
    pub num_epochs: usize,

    /// `auto`, `cpu` or `cuda`
    #[serde(default = "default_device")]
    pub device: String,
}

/// Directory layout shared between stages
///
/// Each directory is written by exactly one stage and read by the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    pub raw_images: PathBuf,
    pub processed_images: PathBuf,
    pub split_data: PathBuf,
    pub inpainting_dataset: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub main_log_file: String,
    /// Default filter directive; `RUST_LOG` takes precedence when set
    pub log_level: String,
    /// The log file is rotated once it grows past this size; 0 disables rotation
    #[serde(default = "default_rotation_mb")]
    pub rotation_mb: u64,
    /// Rotated log files older than this are removed at startup
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataAcquisitionConfig {
    /// MediaWiki API endpoint, e.g. `https://commons.wikimedia.org/w/api.php`
    pub api_url: String,

    /// Root category, including the `Category:` prefix
    pub start_category: String,

    /// Maximum number of files to download
    pub download_limit: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdaConfig {
    pub output_dir: PathBuf,

    /// File extensions to analyze, with leading dot (`.jpg`, `.png`)
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProcessingConfig {
    /// Target size as `[width, height]`
    pub image_size: [u32; 2],

    /// Output encoding, `PNG`, `JPEG` or `BMP`
    pub output_format: String,
}

impl DataProcessingConfig {
    pub fn width(&self) -> u32 {
        self.image_size[0]
    }

    pub fn height(&self) -> u32 {
        self.image_size[1]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSplittingConfig {
    /// Fraction of the corpus held out for testing
    pub test_size: f64,

    /// Fraction of the corpus used for validation
    pub validation_size: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureEngineeringConfig {
    /// Name of the mask strategy; only `random_rectangle` is known
    pub mask_strategy: String,
    pub mask_config: MaskConfig,
}

/// Mask rectangle size bounds, as fractions of the image side
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaskConfig {
    pub min_mask_size_ratio: f64,
    pub max_mask_size_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperparameterTuningConfig {
    /// Where the (stub) tuning stage writes its result
    pub output_file: PathBuf,

    /// Values written verbatim by the stub
    pub dummy_hyperparameters: TrainingHyperparameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub train_batch_size: usize,

    /// Hyperparameter YAML produced by stage 6
    pub hyperparameters_file: PathBuf,

    /// Receives `unet_epoch_N/`, `unet_final/` and `training_metrics.csv`
    pub output_dir: PathBuf,

    /// Save a checkpoint every N epochs
    pub save_model_epochs: usize,

    #[serde(default = "default_log_every")]
    pub log_every_n_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEvaluationConfig {
    /// Directory holding `unet_final/`
    pub trained_model_dir: PathBuf,
    pub output_dir: PathBuf,

    /// `0` evaluates every test sample
    pub num_samples_to_evaluate: usize,
    pub num_inference_steps: usize,

    /// Source of the frozen VAE, text encoder and tokenizer
    #[serde(default = "default_model_id")]
    pub base_model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPreparationConfig {
    pub model_input_dir: PathBuf,
    pub hyperparameters_file: PathBuf,
    pub output_dir: PathBuf,
}

/// Hyperparameters consumed by the trainer
///
/// Produced by the tuning stub and read back from YAML by stage 7.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingHyperparameters {
    /// Hugging Face repository of the pretrained inpainting backbone
    pub model_id: String,
    pub learning_rate: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_weight_decay: f64,
    pub adam_epsilon: f64,
    #[serde(default = "default_mixed_precision")]
    pub mixed_precision: String,
}

impl TrainingHyperparameters {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hyperparameters: {}", path.display()))?;
        let params: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse hyperparameters: {}", path.display()))?;
        info!(path = %path.display(), model_id = %params.model_id, "Loaded hyperparameters");
        Ok(params)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write hyperparameters: {}", path.display()))?;
        Ok(())
    }
}

impl PipelineConfig {
    /// Load and validate a YAML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        let config = Self::from_yaml(&text)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks serde cannot express
    pub fn validate(&self) -> Result<()> {
        let split = &self.data_splitting;
        ensure!(
            (0.0..1.0).contains(&split.test_size),
            "data_splitting.test_size must be in [0, 1), got {}",
            split.test_size
        );
        ensure!(
            (0.0..1.0).contains(&split.validation_size),
            "data_splitting.validation_size must be in [0, 1), got {}",
            split.validation_size
        );
        ensure!(
            split.test_size + split.validation_size < 1.0,
            "data_splitting.test_size + validation_size must be below 1, got {}",
            split.test_size + split.validation_size
        );

        let mask = &self.feature_engineering.mask_config;
        ensure!(
            mask.min_mask_size_ratio > 0.0 && mask.max_mask_size_ratio <= 1.0,
            "feature_engineering.mask_config ratios must lie in (0, 1]"
        );
        ensure!(
            mask.min_mask_size_ratio <= mask.max_mask_size_ratio,
            "feature_engineering.mask_config.min_mask_size_ratio ({}) exceeds max_mask_size_ratio ({})",
            mask.min_mask_size_ratio,
            mask.max_mask_size_ratio
        );

        let size = self.data_processing.image_size;
        ensure!(
            size[0] > 0 && size[1] > 0,
            "data_processing.image_size must be non-zero, got {:?}",
            size
        );
        ensure!(
            size[0] % 8 == 0 && size[1] % 8 == 0,
            "data_processing.image_size must be a multiple of 8 for the VAE, got {:?}",
            size
        );

        ensure!(self.training.train_batch_size > 0, "training.train_batch_size must be positive");
        ensure!(self.training.save_model_epochs > 0, "training.save_model_epochs must be positive");
        ensure!(
            self.model_evaluation.num_inference_steps > 0,
            "model_evaluation.num_inference_steps must be positive"
        );
        ensure!(
            matches!(self.global_params.device.as_str(), "auto" | "cpu" | "cuda"),
            "global_params.device must be one of auto, cpu, cuda; got {}",
            self.global_params.device
        );
        Ok(())
    }
}

fn default_project_name() -> String {
    "inpaint-pipeline".to_string()
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_user_agent() -> String {
    concat!("inpaint-pipeline/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_rotation_mb() -> u64 {
    10
}

fn default_retention_days() -> u64 {
    7
}

fn default_log_every() -> usize {
    10
}

fn default_model_id() -> String {
    "stable-diffusion-v1-5/stable-diffusion-inpainting".to_string()
}

fn default_mixed_precision() -> String {
    "no".to_string()
}
