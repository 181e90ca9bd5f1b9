//! Model loading for the Stable Diffusion inpainting components
//!
//! This module loads everything the trainer and the evaluation pipeline need:
//! - CLIP text encoder (frozen, used once for the empty prompt)
//! - VAE (frozen, image <-> latent)
//! - 9-channel inpainting UNet, either trainable (`VarMap`) or for inference

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::BlockConfig, unet_2d::UNet2DConditionModel, unet_2d::UNet2DConditionModelConfig,
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
    StableDiffusionConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokenizers::{models::bpe::BPE, processors::template::TemplateProcessing, AddedToken, Tokenizer};
use tracing::{debug, info};

/// Latent scaling factor of the SD 1.x VAE
pub const VAE_SCALE: f64 = 0.18215;
/// Noisy latents + mask + masked-image latents
pub const UNET_IN_CHANNELS: usize = 9;
pub const UNET_OUT_CHANNELS: usize = 4;
pub const UNET_WEIGHTS_FILE: &str = "diffusion_pytorch_model.safetensors";
pub const UNET_CONFIG_FILE: &str = "config.json";

const MAX_TOKENS: usize = 77;
const END_OF_TEXT: u32 = 49407;

/// Pick the compute device named in the config
pub fn select_device(name: &str) -> Result<Device> {
    let device = match name {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0).context("CUDA device requested but unavailable")?,
        "auto" => Device::cuda_if_available(0)?,
        other => bail!("Unknown device: {other}"),
    };
    info!(device = ?device, "Selected compute device");
    Ok(device)
}

/// Pipeline-wide SD 1.5 configuration for the given image size
pub fn sd_config(width: u32, height: u32) -> StableDiffusionConfig {
    StableDiffusionConfig::v1_5(None, Some(height as usize), Some(width as usize))
}

/// UNet layout of the SD 1.5 inpainting checkpoint
pub fn unet_config() -> UNet2DConditionModelConfig {
    let block = |out_channels, use_cross_attn| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim: 8,
    };
    UNet2DConditionModelConfig {
        center_input_sample: false,
        flip_sin_to_cos: true,
        freq_shift: 0.0,
        blocks: vec![
            block(320, Some(1)),
            block(640, Some(1)),
            block(1280, Some(1)),
            block(1280, None),
        ],
        layers_per_block: 2,
        downsample_padding: 1,
        mid_block_scale_factor: 1.0,
        norm_num_groups: 32,
        norm_eps: 1e-5,
        cross_attention_dim: 768,
        sliced_attention_size: None,
        use_linear_projection: false,
    }
}

/// Frozen CLIP text encoder
pub struct ClipTextEncoder {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl ClipTextEncoder {
    /// Load CLIP weights and the BPE tokenizer (`vocab.json` + `merges.txt`)
    pub fn load(model_path: &Path, tokenizer_dir: &Path, sd: &StableDiffusionConfig, device: &Device) -> Result<Self> {
        info!(path = %model_path.display(), "Loading CLIP text encoder");
        let tokenizer = Self::load_bpe_tokenizer(tokenizer_dir)?;
        let model = stable_diffusion::build_clip_transformer(&sd.clip, model_path, device, DType::F32)
            .with_context(|| format!("Failed to load CLIP weights from {}", model_path.display()))?;
        info!("✓ CLIP encoder loaded");
        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    fn load_bpe_tokenizer(tokenizer_dir: &Path) -> Result<Tokenizer> {
        let vocab_path = tokenizer_dir.join("vocab.json");
        let merges_path = tokenizer_dir.join("merges.txt");

        if !vocab_path.exists() || !merges_path.exists() {
            bail!(
                "BPE tokenizer requires vocab.json and merges.txt in {}",
                tokenizer_dir.display()
            );
        }

        let bpe = BPE::from_file(&vocab_path.to_string_lossy(), &merges_path.to_string_lossy())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build BPE tokenizer: {}", e))?;

        let mut tokenizer = Tokenizer::new(bpe);
        tokenizer.add_special_tokens(&[
            AddedToken::from("<|startoftext|>", true),
            AddedToken::from("<|endoftext|>", true),
        ]);

        let processor = TemplateProcessing::builder()
            .try_single("<|startoftext|> $A <|endoftext|>")
            .map_err(|e| anyhow::anyhow!("Template processing failed: {}", e))?
            .special_tokens(vec![("<|startoftext|>", 49406), ("<|endoftext|>", END_OF_TEXT)])
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build processor: {}", e))?;
        tokenizer.with_post_processor(Some(processor));

        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::Fixed(MAX_TOKENS),
            pad_id: END_OF_TEXT,
            pad_token: "<|endoftext|>".to_string(),
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to set truncation: {}", e))?;

        Ok(tokenizer)
    }

    /// Hidden states for `prompt`, shape `[1, 77, 768]`
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        let tokens = encoding.get_ids().to_vec();
        if tokens.len() != MAX_TOKENS {
            bail!("CLIP tokenization produced {} tokens, expected {MAX_TOKENS}", tokens.len());
        }

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        let hidden = self.model.forward(&token_ids)?;
        debug!(shape = ?hidden.dims(), "Prompt encoded");
        Ok(hidden)
    }
}

/// Text conditioning for the empty prompt, computed once per stage
pub fn empty_prompt_embedding(
    text_encoder: &Path,
    tokenizer_dir: &Path,
    sd: &StableDiffusionConfig,
    device: &Device,
) -> Result<Tensor> {
    let encoder = ClipTextEncoder::load(text_encoder, tokenizer_dir, sd, device)?;
    let embedding = encoder.encode("")?.detach();
    Ok(embedding)
}

/// Frozen VAE mapping images in `[-1, 1]` to scaled latents and back
pub struct Vae {
    model: AutoEncoderKL,
}

impl Vae {
    pub fn load(model_path: &Path, sd: &StableDiffusionConfig, device: &Device) -> Result<Self> {
        info!(path = %model_path.display(), "Loading VAE");
        let model = sd
            .build_vae(model_path, device, DType::F32)
            .with_context(|| format!("Failed to load VAE weights from {}", model_path.display()))?;
        info!("✓ VAE loaded");
        Ok(Self { model })
    }

    /// RGB autoencoder with an explicit layout, weights taken from `vb`
    pub fn new(vb: VarBuilder, config: AutoEncoderKLConfig) -> Result<Self> {
        let model = AutoEncoderKL::new(vb, 3, 3, config)?;
        Ok(Self { model })
    }

    /// `[B, 3, H, W]` -> `[B, 4, H/8, W/8]`, sampled and scaled
    pub fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let dist = self.model.encode(images)?;
        let latents = (dist.sample()? * VAE_SCALE)?;
        Ok(latents.detach())
    }

    /// `[B, 4, h, w]` -> `[B, 3, 8h, 8w]` in `[-1, 1]`
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let images = self.model.decode(&(latents / VAE_SCALE)?)?;
        Ok(images)
    }
}

/// Trainable inpainting UNet backed by a `VarMap`
pub struct TrainableUnet {
    pub model: UNet2DConditionModel,
    pub varmap: VarMap,
}

impl TrainableUnet {
    /// Freshly initialised 9-channel UNet with the given layout
    pub fn new(config: UNet2DConditionModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = UNet2DConditionModel::new(vb, UNET_IN_CHANNELS, UNET_OUT_CHANNELS, false, config)?;
        Ok(Self { model, varmap })
    }

    /// Build the SD 1.5 UNet on fresh variables, then overwrite them with `weights`
    pub fn load(weights: &Path, device: &Device) -> Result<Self> {
        info!(path = %weights.display(), "Loading trainable UNet");
        let mut unet = Self::new(unet_config(), device)?;
        unet.varmap
            .load(weights)
            .with_context(|| format!("Failed to load UNet weights from {}", weights.display()))?;
        info!(tensors = unet.varmap.all_vars().len(), "✓ UNet loaded");
        Ok(unet)
    }

    /// Write weights and `config.json` into `dir`
    pub fn save(&self, dir: &Path, artifact: &UnetArtifact) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let weights = dir.join(UNET_WEIGHTS_FILE);
        self.varmap
            .save(&weights)
            .with_context(|| format!("Failed to save UNet weights to {}", weights.display()))?;
        artifact.save(&dir.join(UNET_CONFIG_FILE))?;
        info!(dir = %dir.display(), "UNet saved");
        Ok(dir.to_path_buf())
    }
}

/// Inference-only UNet from a saved artifact directory or a hub file
pub fn load_unet(weights: &Path, sd: &StableDiffusionConfig, device: &Device) -> Result<UNet2DConditionModel> {
    info!(path = %weights.display(), "Loading UNet for inference");
    let unet = sd
        .build_unet(weights, device, UNET_IN_CHANNELS, false, DType::F32)
        .with_context(|| format!("Failed to load UNet weights from {}", weights.display()))?;
    Ok(unet)
}

/// `config.json` written next to saved UNet weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnetArtifact {
    pub base_model_id: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub sample_size: [u32; 2],
    pub cross_attention_dim: usize,
    pub epoch: usize,
}

impl UnetArtifact {
    pub fn new(base_model_id: &str, image_size: [u32; 2], epoch: usize) -> Self {
        Self {
            base_model_id: base_model_id.to_string(),
            in_channels: UNET_IN_CHANNELS,
            out_channels: UNET_OUT_CHANNELS,
            sample_size: [image_size[0] / 8, image_size[1] / 8],
            cross_attention_dim: unet_config().cross_attention_dim,
            epoch,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Mask `[B, 1, H, W]` reduced to latent resolution with nearest sampling
pub fn latent_mask(mask: &Tensor, latents: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = latents.dims4()?;
    Ok(mask.upsample_nearest2d(h, w)?)
}

/// Concatenate `[noisy, mask, masked_latents]` along channels
pub fn unet_input(noisy: &Tensor, mask: &Tensor, masked_latents: &Tensor) -> Result<Tensor> {
    Ok(Tensor::cat(&[noisy, mask, masked_latents], 1)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two-level UNet small enough to train on CPU in a unit test
    pub(crate) fn tiny_unet_config() -> UNet2DConditionModelConfig {
        let block = |use_cross_attn| BlockConfig {
            out_channels: 32,
            use_cross_attn,
            attention_head_dim: 4,
        };
        UNet2DConditionModelConfig {
            blocks: vec![block(Some(1)), block(None)],
            layers_per_block: 1,
            norm_num_groups: 8,
            cross_attention_dim: TINY_CONTEXT_DIM,
            ..unet_config()
        }
    }

    pub(crate) const TINY_CONTEXT_DIM: usize = 16;

    /// Four levels so latents are 1/8 of the image, like the real VAE
    pub(crate) fn tiny_vae_config() -> AutoEncoderKLConfig {
        AutoEncoderKLConfig {
            block_out_channels: vec![8, 8, 8, 8],
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 4,
            use_quant_conv: true,
            use_post_quant_conv: true,
        }
    }

    pub(crate) fn tiny_text_embedding(device: &Device) -> Tensor {
        Tensor::zeros((1, 4, TINY_CONTEXT_DIM), DType::F32, device).unwrap()
    }

    #[test]
    fn test_tiny_unet_predicts_latent_shaped_noise() {
        let device = Device::Cpu;
        let unet = TrainableUnet::new(tiny_unet_config(), &device).unwrap();
        let vae = Vae::new(
            VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device),
            tiny_vae_config(),
        )
        .unwrap();

        let images = Tensor::zeros((1, 3, 16, 16), DType::F32, &device).unwrap();
        let latents = vae.encode(&images).unwrap();
        assert_eq!(latents.dims(), &[1, 4, 2, 2]);

        let mask = Tensor::ones((1, 1, 16, 16), DType::F32, &device).unwrap();
        let input = unet_input(&latents, &latent_mask(&mask, &latents).unwrap(), &latents).unwrap();
        let out = unet.model.forward(&input, 10.0, &tiny_text_embedding(&device)).unwrap();
        assert_eq!(out.dims(), &[1, UNET_OUT_CHANNELS, 2, 2]);

        let decoded = vae.decode(&latents).unwrap();
        assert_eq!(decoded.dims(), &[1, 3, 16, 16]);
    }

    #[test]
    fn test_unet_config_matches_inpainting_checkpoint() {
        let config = unet_config();
        let channels: Vec<usize> = config.blocks.iter().map(|b| b.out_channels).collect();
        assert_eq!(channels, vec![320, 640, 1280, 1280]);
        assert!(config.blocks[3].use_cross_attn.is_none());
        assert_eq!(config.cross_attention_dim, 768);
    }

    #[test]
    fn test_latent_mask_and_unet_input_shapes() {
        let device = Device::Cpu;
        let mask = Tensor::ones((2, 1, 64, 64), DType::F32, &device).unwrap();
        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &device).unwrap();

        let small = latent_mask(&mask, &latents).unwrap();
        assert_eq!(small.dims(), &[2, 1, 8, 8]);

        let input = unet_input(&latents, &small, &latents).unwrap();
        assert_eq!(input.dims(), &[2, UNET_IN_CHANNELS, 8, 8]);
    }

    #[test]
    fn test_unet_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(UNET_CONFIG_FILE);
        let artifact = UnetArtifact::new("base/model", [512, 384], 3);
        artifact.save(&path).unwrap();

        let loaded = UnetArtifact::load(&path).unwrap();
        assert_eq!(loaded, artifact);
        assert_eq!(loaded.sample_size, [64, 48]);
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        assert!(select_device("tpu").is_err());
        assert!(matches!(select_device("cpu").unwrap(), Device::Cpu));
    }

    #[test]
    fn test_tokenizer_requires_vocab_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ClipTextEncoder::load_bpe_tokenizer(dir.path()).is_err());
    }
}
