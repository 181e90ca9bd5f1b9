//! Stable Diffusion inpainting inference
//!
//! This module runs the reconstruction workflow for one image:
//! 1. Encode the masked image with the VAE
//! 2. Denoise with the 9-channel UNet under DDIM
//! 3. VAE decode to RGB

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_transformers::models::stable_diffusion::{unet_2d::UNet2DConditionModel, StableDiffusionConfig};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use tracing::{debug, info};

use crate::dataset::{apply_mask, image_to_tensor, mask_to_tensor, tensor_to_image};
use crate::evaluation::Inpainter;
use crate::models::{self, Vae};
use crate::schedule::seeded_noise;

/// Complete inpainting pipeline
pub struct InpaintPipeline {
    unet: UNet2DConditionModel,
    vae: Vae,
    sd: StableDiffusionConfig,
    text_embedding: Tensor,
    num_inference_steps: usize,
    seed: u64,
    width: u32,
    height: u32,
    device: Device,
}

impl InpaintPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        unet: UNet2DConditionModel,
        vae: Vae,
        sd: StableDiffusionConfig,
        text_embedding: Tensor,
        num_inference_steps: usize,
        seed: u64,
        image_size: [u32; 2],
        device: &Device,
    ) -> Self {
        Self {
            unet,
            vae,
            sd,
            text_embedding,
            num_inference_steps,
            seed,
            width: image_size[0],
            height: image_size[1],
            device: device.clone(),
        }
    }

    /// Denoise from seeded noise. The 9-channel UNet sees the mask and the
    /// masked-image latents at every step, so latents are not re-blended.
    fn denoise(&self, mask: &Tensor, masked_latents: &Tensor) -> Result<Tensor> {
        let mut scheduler = self.sd.build_scheduler(self.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let noise = seeded_noise(masked_latents.dims(), self.seed, &self.device)?;
        let mut latents = (noise * scheduler.init_noise_sigma())?;

        let total = timesteps.len();
        for (i, &t) in timesteps.iter().enumerate() {
            let scaled = scheduler.scale_model_input(latents.clone(), t)?;
            let input = models::unet_input(&scaled, mask, masked_latents)?;
            let noise_pred = self.unet.forward(&input, t as f64, &self.text_embedding)?;
            latents = scheduler.step(&noise_pred, t, &latents)?;

            if (i + 1) % 5 == 0 || i + 1 == total {
                debug!(step = i + 1, total, "Denoising progress");
            }
        }
        Ok(latents)
    }
}

impl Inpainter for InpaintPipeline {
    fn inpaint(&mut self, image: &RgbImage, mask: &GrayImage) -> Result<RgbImage> {
        let (orig_w, orig_h) = image.dimensions();
        let resized = DynamicImage::ImageRgb8(image.clone())
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb8();
        let resized_mask = DynamicImage::ImageLuma8(mask.clone())
            .resize_exact(self.width, self.height, FilterType::Nearest)
            .to_luma8();

        let original = image_to_tensor(&resized, &self.device)?.unsqueeze(0)?;
        let mask = mask_to_tensor(&resized_mask, &self.device)?.unsqueeze(0)?;
        let masked = apply_mask(&original, &mask)?;

        let masked_latents = self.vae.encode(&masked).context("VAE encode failed")?;
        let latent_mask = models::latent_mask(&mask, &masked_latents)?;

        info!(steps = self.num_inference_steps, seed = self.seed, "Denoising");
        let latents = self.denoise(&latent_mask, &masked_latents)?;

        let decoded = self.vae.decode(&latents).context("VAE decode failed")?;
        let out = tensor_to_image(&decoded)?;
        if (orig_w, orig_h) == out.dimensions() {
            Ok(out)
        } else {
            Ok(DynamicImage::ImageRgb8(out)
                .resize_exact(orig_w, orig_h, FilterType::Lanczos3)
                .to_rgb8())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{tiny_text_embedding, tiny_unet_config, tiny_vae_config};
    use crate::models::TrainableUnet;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};
    use image::{Luma, Rgb};

    #[test]
    fn test_reconstruction_keeps_the_input_size() {
        let device = Device::Cpu;
        let unet = TrainableUnet::new(tiny_unet_config(), &device).unwrap().model;
        let vae = Vae::new(VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device), tiny_vae_config()).unwrap();
        let mut pipeline = InpaintPipeline::new(
            unet,
            vae,
            models::sd_config(16, 16),
            tiny_text_embedding(&device),
            3,
            0,
            [16, 16],
            &device,
        );

        let image = RgbImage::from_pixel(20, 12, Rgb([200, 40, 90]));
        let mask = GrayImage::from_fn(20, 12, |x, _| Luma([if x < 10 { 255 } else { 0 }]));
        let out = pipeline.inpaint(&image, &mask).unwrap();
        assert_eq!(out.dimensions(), (20, 12));

        let same_size = RgbImage::from_pixel(16, 16, Rgb([0, 0, 0]));
        let mask = GrayImage::new(16, 16);
        assert_eq!(pipeline.inpaint(&same_size, &mask).unwrap().dimensions(), (16, 16));
    }
}
