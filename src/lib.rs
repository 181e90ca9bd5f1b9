//! Image inpainting research pipeline
//!
//! Takes a corpus of images from acquisition to a deployable fine-tuned
//! Stable Diffusion inpainting UNet, in nine sequential stages:
//!
//! 1. acquire images from a MediaWiki category tree
//! 2. exploratory analysis of the raw corpus
//! 3. resize and re-encode
//! 4. train / validation / test split
//! 5. synthesise rectangular masks
//! 6. write hyperparameters (search is a stub)
//! 7. fine-tune the UNet with Candle
//! 8. evaluate reconstructions (PSNR / SSIM)
//! 9. package the model bundle
//!
//! ## Usage
//!
//! ```rust,ignore
//! use inpaint_pipeline::config::PipelineConfig;
//! use inpaint_pipeline::stages::run_pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load("config/main_config.yaml".as_ref())?;
//!     inpaint_pipeline::logging::init(&config.logging)?;
//!
//!     let stages: Vec<String> = (3..=5).map(|i| i.to_string()).collect();
//!     let report = run_pipeline(&stages, &config).await;
//!     println!("completed: {:?}", report.completed);
//!     Ok(())
//! }
//! ```

pub mod acquisition;
pub mod analysis;
pub mod compare;
pub mod config;
pub mod dataset;
pub mod download;
pub mod evaluation;
pub mod files;
pub mod logging;
pub mod masking;
pub mod metrics;
pub mod models;
pub mod packaging;
pub mod pipeline;
pub mod plot;
pub mod processing;
pub mod progress;
pub mod schedule;
pub mod splitting;
pub mod stages;
pub mod training;
pub mod tuning;
