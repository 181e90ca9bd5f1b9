//! Pretrained component downloader for the HuggingFace Hub
//!
//! Fetches the parts of a Stable Diffusion inpainting repository that the
//! trainer and evaluator load:
//! - CLIP tokenizer (`vocab.json` + `merges.txt`) and text encoder
//! - VAE
//! - 9-channel inpainting UNet
//! - scheduler configuration

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiRepo};
use std::path::{Path, PathBuf};
use tracing::info;

/// Model downloader that caches files using HuggingFace Hub
pub struct ModelDownloader {
    api: Api,
}

impl ModelDownloader {
    /// Uses the HF_TOKEN environment variable if set
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API client")?;
        Ok(Self { api })
    }

    /// Download every component of `model_id`, in parallel
    pub async fn download_inpainting_components(&self, model_id: &str) -> Result<ModelPaths> {
        info!(model_id, "Downloading pretrained inpainting components");
        let repo = self.api.repo(hf_hub::Repo::model(model_id.to_string()));

        let (vocab, _merges, text_encoder, vae, unet, scheduler_config) = tokio::try_join!(
            fetch(&repo, "tokenizer/vocab.json"),
            fetch(&repo, "tokenizer/merges.txt"),
            fetch(&repo, "text_encoder/model.safetensors"),
            fetch(&repo, "vae/diffusion_pytorch_model.safetensors"),
            fetch(&repo, "unet/diffusion_pytorch_model.safetensors"),
            fetch(&repo, "scheduler/scheduler_config.json"),
        )?;

        let tokenizer_dir = vocab
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not determine tokenizer directory"))?
            .to_path_buf();

        info!("✓ All components downloaded");
        Ok(ModelPaths {
            tokenizer_dir,
            text_encoder,
            vae,
            unet,
            scheduler_config,
        })
    }
}

async fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf> {
    let path = repo
        .get(file)
        .await
        .with_context(|| format!("Failed to download {file}"))?;
    info!("  ✓ {file}: {}", path.display());
    Ok(path)
}

/// Local paths of the downloaded components
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    /// Directory containing `vocab.json` and `merges.txt`
    pub tokenizer_dir: PathBuf,
    pub text_encoder: PathBuf,
    pub vae: PathBuf,
    pub unet: PathBuf,
    pub scheduler_config: PathBuf,
}

impl ModelPaths {
    /// Paths inside a local snapshot laid out like the hub repository
    pub fn from_snapshot(root: &Path) -> Self {
        Self {
            tokenizer_dir: root.join("tokenizer"),
            text_encoder: root.join("text_encoder/model.safetensors"),
            vae: root.join("vae/diffusion_pytorch_model.safetensors"),
            unet: root.join("unet/diffusion_pytorch_model.safetensors"),
            scheduler_config: root.join("scheduler/scheduler_config.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_layout() {
        let paths = ModelPaths::from_snapshot(Path::new("/models/sd-inpaint"));
        assert_eq!(paths.tokenizer_dir, Path::new("/models/sd-inpaint/tokenizer"));
        assert!(paths.unet.ends_with("unet/diffusion_pytorch_model.safetensors"));
        assert!(paths.scheduler_config.ends_with("scheduler/scheduler_config.json"));
    }
}
