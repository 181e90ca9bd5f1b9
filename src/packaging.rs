//! Deployment bundle assembly

use anyhow::{ensure, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::files;

pub const MODEL_DIR: &str = "unet_final";
pub const README: &str = "README.md";

pub struct Packager {
    model_input_dir: PathBuf,
    hyperparameters_file: PathBuf,
    output_dir: PathBuf,
}

impl Packager {
    pub fn new(model_input_dir: &Path, hyperparameters_file: &Path, output_dir: &Path) -> Self {
        Self {
            model_input_dir: model_input_dir.to_path_buf(),
            hyperparameters_file: hyperparameters_file.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Build a fresh bundle in `output_dir`, replacing any previous one
    pub fn prepare(&self) -> Result<PathBuf> {
        ensure!(
            self.model_input_dir.is_dir(),
            "Trained model directory not found: {}",
            self.model_input_dir.display()
        );
        ensure!(
            self.hyperparameters_file.is_file(),
            "Hyperparameters file not found: {}",
            self.hyperparameters_file.display()
        );

        if self.output_dir.exists() {
            warn!(dir = %self.output_dir.display(), "Removing existing deployment directory");
            std::fs::remove_dir_all(&self.output_dir)
                .with_context(|| format!("Failed to remove {}", self.output_dir.display()))?;
        }
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let model_target = self.output_dir.join(MODEL_DIR);
        files::copy_dir_all(&self.model_input_dir, &model_target)?;
        info!(from = %self.model_input_dir.display(), to = %model_target.display(), "Copied model");

        let params_name = files::file_name(&self.hyperparameters_file);
        let params_target = self.output_dir.join(&params_name);
        std::fs::copy(&self.hyperparameters_file, &params_target)
            .with_context(|| format!("Failed to copy {}", self.hyperparameters_file.display()))?;

        let readme = self.output_dir.join(README);
        std::fs::write(&readme, readme_text(&params_name))
            .with_context(|| format!("Failed to write {}", readme.display()))?;

        info!(dir = %self.output_dir.display(), "Deployment bundle ready");
        Ok(self.output_dir.clone())
    }
}

fn readme_text(params_name: &str) -> String {
    format!(
        "# Inpainting model bundle\n\n\
         Fine-tuned UNet for image inpainting on top of a Stable Diffusion\n\
         inpainting backbone.\n\n\
         ## Contents\n\n\
         - `{MODEL_DIR}/`: UNet weights (`diffusion_pytorch_model.safetensors`) and `config.json`\n\
         - `{params_name}`: hyperparameters used for training\n\n\
         ## Usage\n\n\
         Load the backbone's tokenizer, text encoder, VAE and scheduler from the\n\
         `model_id` named in `{params_name}`, then replace its UNet with the\n\
         weights in `{MODEL_DIR}/`. The UNet takes 9 latent channels: noisy\n\
         latents, the downsampled mask and the masked-image latents.\n"
    )
}
