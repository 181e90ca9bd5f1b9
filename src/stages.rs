//! Stage registry and sequential runner
//!
//! Stages are addressed by the ids `"1"` to `"9"`, run strictly in the
//! order given, and the run stops at the first stage that fails.

use anyhow::{bail, Result};
use std::fmt;
use std::path::Path;
use tracing::{error, info, warn};

use crate::acquisition::DataAcquirer;
use crate::analysis::ExploratoryDataAnalyzer;
use crate::config::{PipelineConfig, TrainingHyperparameters};
use crate::dataset::InpaintingDataset;
use crate::download::{ModelDownloader, ModelPaths};
use crate::evaluation::Evaluator;
use crate::masking::{MaskGenerator, MaskStrategy};
use crate::models::{self, TrainableUnet, Vae, UNET_WEIGHTS_FILE};
use crate::packaging::Packager;
use crate::pipeline::InpaintPipeline;
use crate::processing::ImageProcessor;
use crate::schedule::NoiseSchedule;
use crate::splitting::{DataSplitter, Split};
use crate::training::{Trainer, TrainingOptions, FINAL_MODEL_DIR};
use crate::tuning;

/// Fixed sampling seed so evaluation runs are comparable
const EVALUATION_SEED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DataAcquisition,
    ExploratoryDataAnalysis,
    DataProcessing,
    DataSplitting,
    FeatureEngineering,
    HyperparameterTuning,
    ModelTraining,
    ModelEvaluation,
    DeploymentPreparation,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::DataAcquisition,
        Stage::ExploratoryDataAnalysis,
        Stage::DataProcessing,
        Stage::DataSplitting,
        Stage::FeatureEngineering,
        Stage::HyperparameterTuning,
        Stage::ModelTraining,
        Stage::ModelEvaluation,
        Stage::DeploymentPreparation,
    ];

    pub fn from_id(id: &str) -> Option<Stage> {
        let index: usize = id.trim().parse().ok()?;
        Self::ALL.get(index.checked_sub(1)?).copied()
    }

    pub fn id(self) -> usize {
        Self::ALL.iter().position(|&s| s == self).map_or(0, |i| i + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::DataAcquisition => "Data Acquisition",
            Stage::ExploratoryDataAnalysis => "Exploratory Data Analysis",
            Stage::DataProcessing => "Data Processing",
            Stage::DataSplitting => "Data Splitting",
            Stage::FeatureEngineering => "Feature Engineering",
            Stage::HyperparameterTuning => "Hyperparameter Tuning",
            Stage::ModelTraining => "Model Training",
            Stage::ModelEvaluation => "Model Evaluation",
            Stage::DeploymentPreparation => "Deployment Preparation",
        }
    }

    pub async fn run(self, config: &PipelineConfig) -> Result<()> {
        match self {
            Stage::DataAcquisition => run_acquisition(config).await,
            Stage::ExploratoryDataAnalysis => run_analysis(config),
            Stage::DataProcessing => run_processing(config),
            Stage::DataSplitting => run_splitting(config),
            Stage::FeatureEngineering => run_feature_engineering(config),
            Stage::HyperparameterTuning => run_tuning(config),
            Stage::ModelTraining => run_training(config).await,
            Stage::ModelEvaluation => run_evaluation(config).await,
            Stage::DeploymentPreparation => run_packaging(config),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.id(), self.name())
    }
}

/// What happened during one pipeline run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: Vec<Stage>,
    pub failed: Option<Stage>,
    pub unknown: Vec<String>,
}

/// Run `ids` in order, halting at the first failure
pub async fn run_pipeline(ids: &[String], config: &PipelineConfig) -> RunReport {
    let mut report = RunReport::default();
    for id in ids {
        let Some(stage) = Stage::from_id(id) else {
            warn!(id = %id, "Unknown stage, skipping");
            report.unknown.push(id.clone());
            continue;
        };

        info!(">>>>>> {} started <<<<<<", stage);
        match stage.run(config).await {
            Ok(()) => {
                info!(">>>>>> {} completed <<<<<<", stage);
                report.completed.push(stage);
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "{} failed, halting pipeline", stage);
                report.failed = Some(stage);
                break;
            }
        }
    }
    report
}

async fn run_acquisition(config: &PipelineConfig) -> Result<()> {
    let acq = &config.data_acquisition;
    let acquirer = DataAcquirer::new(&acq.api_url, &acq.user_agent)?;
    acquirer
        .download_images_from_category(&acq.start_category, &config.data_paths.raw_images, acq.download_limit)
        .await?;
    Ok(())
}

fn run_analysis(config: &PipelineConfig) -> Result<()> {
    let eda = &config.exploratory_data_analysis;
    ExploratoryDataAnalyzer::new(&config.data_paths.raw_images, &eda.output_dir, &eda.extensions).run()?;
    Ok(())
}

fn run_processing(config: &PipelineConfig) -> Result<()> {
    let processing = &config.data_processing;
    let summary = ImageProcessor::new(
        &config.data_paths.raw_images,
        &config.data_paths.processed_images,
        processing.image_size,
        &processing.output_format,
    )?
    .process_images()?;
    if summary.total_found > 0 && summary.processed_count == 0 {
        bail!("None of the {} images could be processed", summary.total_found);
    }
    Ok(())
}

fn run_splitting(config: &PipelineConfig) -> Result<()> {
    let split = &config.data_splitting;
    DataSplitter::new(
        &config.data_paths.processed_images,
        &config.data_paths.split_data,
        split.test_size,
        split.validation_size,
        config.global_params.seed,
    )
    .split_data()?;
    Ok(())
}

fn run_feature_engineering(config: &PipelineConfig) -> Result<()> {
    let fe = &config.feature_engineering;
    let strategy = MaskStrategy::parse(&fe.mask_strategy)?;
    let generator = MaskGenerator::new(strategy, fe.mask_config, config.global_params.seed);

    for split in Split::ALL {
        let input = config.data_paths.split_data.join(split.dir_name());
        if !input.is_dir() {
            warn!(split = %split, dir = %input.display(), "Split directory not found, skipping");
            continue;
        }
        let output = config.data_paths.inpainting_dataset.join(split.dir_name());
        generator.create_inpainting_dataset(&input, &output)?;
    }
    Ok(())
}

fn run_tuning(config: &PipelineConfig) -> Result<()> {
    let tuning = &config.hyperparameter_tuning;
    tuning::write_dummy_hyperparameters(&tuning.dummy_hyperparameters, &tuning.output_file)
}

/// A local directory laid out like the hub repository is used as is
async fn resolve_components(model_id: &str) -> Result<ModelPaths> {
    let local = Path::new(model_id);
    if local.is_dir() {
        info!(dir = %local.display(), "Using local model snapshot");
        return Ok(ModelPaths::from_snapshot(local));
    }
    ModelDownloader::new()?.download_inpainting_components(model_id).await
}

async fn run_training(config: &PipelineConfig) -> Result<()> {
    let training = &config.training;
    let params = TrainingHyperparameters::load(&training.hyperparameters_file)?;
    let image_size = config.data_processing.image_size;

    let dataset_root = &config.data_paths.inpainting_dataset;
    let train = InpaintingDataset::open(dataset_root, Split::Train, image_size)?;
    let validation = if dataset_root.join(Split::Validation.dir_name()).is_dir() {
        Some(InpaintingDataset::open(dataset_root, Split::Validation, image_size)?)
    } else {
        warn!("No validation split, skipping validation loss");
        None
    };

    let device = models::select_device(&config.global_params.device)?;
    let paths = resolve_components(&params.model_id).await?;
    let sd = models::sd_config(image_size[0], image_size[1]);

    let text_embedding = models::empty_prompt_embedding(&paths.text_encoder, &paths.tokenizer_dir, &sd, &device)?;
    let vae = Vae::load(&paths.vae, &sd, &device)?;
    let unet = TrainableUnet::load(&paths.unet, &device)?;
    let schedule = NoiseSchedule::load(&paths.scheduler_config)?;

    let mut trainer = Trainer::new(
        unet,
        vae,
        text_embedding,
        schedule,
        &params,
        config.global_params.seed,
        &device,
    )?;
    let options = TrainingOptions {
        num_epochs: config.global_params.num_epochs,
        batch_size: training.train_batch_size,
        save_model_epochs: training.save_model_epochs,
        log_every_n_steps: training.log_every_n_steps,
        output_dir: training.output_dir.clone(),
        image_size,
        seed: config.global_params.seed,
    };
    let history = trainer.fit(&train, validation.as_ref(), &options)?;

    let final_dir = training.output_dir.join(FINAL_MODEL_DIR);
    trainer.save(&final_dir, image_size, history.len())?;
    info!(dir = %final_dir.display(), "Final model saved");
    Ok(())
}

async fn run_evaluation(config: &PipelineConfig) -> Result<()> {
    let eval = &config.model_evaluation;
    let image_size = config.data_processing.image_size;
    let weights = eval.trained_model_dir.join(FINAL_MODEL_DIR).join(UNET_WEIGHTS_FILE);
    if !weights.is_file() {
        bail!("Trained model not found: {}", weights.display());
    }

    let device = models::select_device(&config.global_params.device)?;
    let paths = resolve_components(&eval.base_model_id).await?;
    let sd = models::sd_config(image_size[0], image_size[1]);

    let text_embedding = models::empty_prompt_embedding(&paths.text_encoder, &paths.tokenizer_dir, &sd, &device)?;
    let vae = Vae::load(&paths.vae, &sd, &device)?;
    let unet = models::load_unet(&weights, &sd, &device)?;

    let mut pipeline = InpaintPipeline::new(
        unet,
        vae,
        sd,
        text_embedding,
        eval.num_inference_steps,
        EVALUATION_SEED,
        image_size,
        &device,
    );
    let test_dir = config.data_paths.inpainting_dataset.join(Split::Test.dir_name());
    Evaluator::new(&test_dir, &eval.output_dir, eval.num_samples_to_evaluate).evaluate(&mut pipeline)?;
    Ok(())
}

fn run_packaging(config: &PipelineConfig) -> Result<()> {
    let deploy = &config.deployment_preparation;
    Packager::new(&deploy.model_input_dir, &deploy.hyperparameters_file, &deploy.output_dir).prepare()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(root: &Path) -> PipelineConfig {
        let yaml = crate::config::tests::SAMPLE.replace("artifacts/", &format!("{}/", root.join("artifacts").display()));
        PipelineConfig::from_yaml(&yaml).unwrap()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stage_ids() {
        assert_eq!(Stage::from_id("1"), Some(Stage::DataAcquisition));
        assert_eq!(Stage::from_id(" 9 "), Some(Stage::DeploymentPreparation));
        assert_eq!(Stage::from_id("0"), None);
        assert_eq!(Stage::from_id("10"), None);
        assert_eq!(Stage::from_id("train"), None);
        for stage in Stage::ALL {
            assert_eq!(Stage::from_id(&stage.id().to_string()), Some(stage));
        }
    }

    #[tokio::test]
    async fn test_unknown_ids_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());

        let report = run_pipeline(&ids(&["42", "6"]), &config).await;
        assert_eq!(report.unknown, vec!["42".to_string()]);
        assert_eq!(report.completed, vec![Stage::HyperparameterTuning]);
        assert!(config.hyperparameter_tuning.output_file.is_file());
    }

    #[tokio::test]
    async fn test_first_failure_halts_the_run() {
        let root = tempfile::tempdir().unwrap();
        let config = config_in(root.path());

        // no trained model yet, so packaging fails before tuning can run
        let report = run_pipeline(&ids(&["9", "6"]), &config).await;
        assert_eq!(report.failed, Some(Stage::DeploymentPreparation));
        assert!(report.completed.is_empty());
        assert!(!config.hyperparameter_tuning.output_file.exists());
    }
}
