//! Fine-tuning loop for the inpainting UNet
//!
//! Only the UNet is optimised. The VAE and the CLIP text encoder stay frozen:
//! the VAE maps images to latents and the text encoder runs once to produce
//! the empty-prompt conditioning shared by every step.

use anyhow::{ensure, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::TrainingHyperparameters;
use crate::dataset::{epoch_batches, InpaintingBatch, InpaintingDataset};
use crate::models::{self, TrainableUnet, UnetArtifact, Vae};
use crate::progress;
use crate::schedule::{seeded_noise, NoiseSchedule};

pub const METRICS_FILE: &str = "training_metrics.csv";
pub const FINAL_MODEL_DIR: &str = "unet_final";

/// Validation draws the same timesteps and noise every epoch
const VALIDATION_SEED: u64 = 0x5eed;

/// Directory name of the checkpoint written after `epoch` (1-based)
pub fn checkpoint_dir_name(epoch: usize) -> String {
    format!("unet_epoch_{epoch}")
}

/// Whether a checkpoint is due after `epoch` (1-based)
pub fn is_checkpoint_epoch(epoch: usize, save_every: usize) -> bool {
    save_every > 0 && epoch % save_every == 0
}

/// Mean losses of one epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochLosses {
    pub epoch: usize,
    pub train_loss: f64,
    pub validation_loss: Option<f64>,
}

/// Loop settings taken from the pipeline configuration
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub save_model_epochs: usize,
    pub log_every_n_steps: usize,
    pub output_dir: PathBuf,
    pub image_size: [u32; 2],
    pub seed: u64,
}

pub struct Trainer {
    unet: TrainableUnet,
    vae: Vae,
    text_embedding: Tensor,
    schedule: NoiseSchedule,
    optimizer: AdamW,
    device: Device,
    rng: Pcg64,
    base_model_id: String,
}

impl Trainer {
    pub fn new(
        unet: TrainableUnet,
        vae: Vae,
        text_embedding: Tensor,
        schedule: NoiseSchedule,
        params: &TrainingHyperparameters,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if params.mixed_precision != "no" {
            warn!(
                mixed_precision = %params.mixed_precision,
                "Mixed precision is not supported, training in F32"
            );
        }
        let optimizer = AdamW::new(
            unet.varmap.all_vars(),
            ParamsAdamW {
                lr: params.learning_rate,
                beta1: params.adam_beta1,
                beta2: params.adam_beta2,
                eps: params.adam_epsilon,
                weight_decay: params.adam_weight_decay,
            },
        )?;
        info!(
            lr = params.learning_rate,
            weight_decay = params.adam_weight_decay,
            "Optimizer ready"
        );
        Ok(Self {
            unet,
            vae,
            text_embedding,
            schedule,
            optimizer,
            device: device.clone(),
            rng: Pcg64::seed_from_u64(seed),
            base_model_id: params.model_id.clone(),
        })
    }

    /// Noise-prediction MSE for one batch at the given per-example timesteps.
    /// `noise_seed` makes the target noise reproducible; `None` draws it on
    /// the device.
    fn loss(&self, batch: &InpaintingBatch, timesteps: &[usize], noise_seed: Option<u64>) -> Result<Tensor> {
        let latents = self.vae.encode(&batch.original)?;
        let masked_latents = self.vae.encode(&batch.masked)?;
        let mask = models::latent_mask(&batch.mask, &latents)?;

        let noise = match noise_seed {
            Some(seed) => seeded_noise(latents.dims(), seed, &self.device)?.to_dtype(latents.dtype())?,
            None => latents.randn_like(0.0, 1.0)?,
        };
        let noisy = self.schedule.add_noise(&latents, &noise, timesteps)?;
        let input = models::unet_input(&noisy, &mask, &masked_latents)?;

        // The UNet takes a scalar timestep, so examples run one at a time.
        let mut predictions = Vec::with_capacity(timesteps.len());
        for (i, &t) in timesteps.iter().enumerate() {
            let sample = input.narrow(0, i, 1)?;
            predictions.push(self.unet.model.forward(&sample, t as f64, &self.text_embedding)?);
        }
        let predicted = Tensor::cat(&predictions, 0)?;

        Ok(candle_nn::loss::mse(&predicted, &noise)?)
    }

    /// One optimisation step; returns the batch loss
    pub fn train_step(&mut self, batch: &InpaintingBatch) -> Result<f64> {
        let timesteps = self.schedule.sample_timesteps(batch.len()?, &mut self.rng);
        let loss = self.loss(batch, &timesteps, None)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()? as f64)
    }

    /// Mean loss over `dataset` without updating weights. Timesteps and noise
    /// come from a fixed seed of their own, so every epoch scores the same
    /// draws and the training RNG is left untouched.
    pub fn evaluate_loss(&self, dataset: &InpaintingDataset, batch_size: usize) -> Result<Option<f64>> {
        if dataset.is_empty() {
            return Ok(None);
        }
        let mut rng = Pcg64::seed_from_u64(VALIDATION_SEED);
        let mut total = 0.0;
        let mut count = 0usize;
        for (b, indices) in epoch_batches::<Pcg64>(dataset.len(), batch_size, None).into_iter().enumerate() {
            let batch = dataset.batch(&indices, &self.device)?;
            let timesteps = self.schedule.sample_timesteps(indices.len(), &mut rng);
            let noise_seed = VALIDATION_SEED.wrapping_add(b as u64);
            let loss = self.loss(&batch, &timesteps, Some(noise_seed))?.to_scalar::<f32>()? as f64;
            total += loss * indices.len() as f64;
            count += indices.len();
        }
        Ok(Some(total / count as f64))
    }

    /// Run the full loop; checkpoints and metrics go under `options.output_dir`
    pub fn fit(
        &mut self,
        train: &InpaintingDataset,
        validation: Option<&InpaintingDataset>,
        options: &TrainingOptions,
    ) -> Result<Vec<EpochLosses>> {
        ensure!(!train.is_empty(), "Training split is empty");
        std::fs::create_dir_all(&options.output_dir)
            .with_context(|| format!("Failed to create {}", options.output_dir.display()))?;

        let steps_per_epoch = train.len().div_ceil(options.batch_size.max(1));
        info!(
            samples = train.len(),
            epochs = options.num_epochs,
            batch_size = options.batch_size,
            steps_per_epoch,
            "Starting training"
        );

        let mut history = Vec::with_capacity(options.num_epochs);
        let mut global_step = 0usize;
        for epoch in 1..=options.num_epochs {
            let mut shuffle_rng = Pcg64::seed_from_u64(options.seed.wrapping_add(epoch as u64));
            let mut epoch_total = 0.0;
            let pb = progress::bar(steps_per_epoch, "Training");
            for (step, indices) in epoch_batches(train.len(), options.batch_size, Some(&mut shuffle_rng))
                .into_iter()
                .enumerate()
            {
                let batch = train.batch(&indices, &self.device)?;
                let loss = self.train_step(&batch)?;
                epoch_total += loss;
                global_step += 1;
                pb.inc(1);
                if options.log_every_n_steps > 0 && global_step % options.log_every_n_steps == 0 {
                    info!(epoch, step = step + 1, global_step, loss, "Training progress");
                } else {
                    debug!(epoch, step = step + 1, loss, "Step done");
                }
            }
            pb.finish_and_clear();

            let validation_loss = match validation {
                Some(dataset) => self.evaluate_loss(dataset, options.batch_size)?,
                None => None,
            };
            let losses = EpochLosses {
                epoch,
                train_loss: epoch_total / steps_per_epoch as f64,
                validation_loss,
            };
            info!(
                epoch,
                train_loss = losses.train_loss,
                validation_loss = ?losses.validation_loss,
                "Epoch complete"
            );
            history.push(losses);
            write_metrics(&options.output_dir.join(METRICS_FILE), &history)?;

            if is_checkpoint_epoch(epoch, options.save_model_epochs) {
                let dir = options.output_dir.join(checkpoint_dir_name(epoch));
                self.save(&dir, options.image_size, epoch)?;
            }
        }
        Ok(history)
    }

    pub fn save(&self, dir: &Path, image_size: [u32; 2], epoch: usize) -> Result<PathBuf> {
        let artifact = UnetArtifact::new(&self.base_model_id, image_size, epoch);
        self.unet.save(dir, &artifact)
    }
}

/// Rewrite the per-epoch loss table
pub fn write_metrics(path: &Path, history: &[EpochLosses]) -> Result<()> {
    let mut csv = String::from("epoch,train_loss,validation_loss\n");
    for row in history {
        let validation = row.validation_loss.map(|v| v.to_string()).unwrap_or_default();
        let _ = writeln!(csv, "{},{},{}", row.epoch, row.train_loss, validation);
    }
    std::fs::write(path, csv).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
