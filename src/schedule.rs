//! Forward diffusion process used by the training loop
//!
//! The pretrained backbone ships a `scheduler_config.json` that fixes the
//! beta schedule. Training only needs the closed form
//! `x_t = sqrt(a_t) * x_0 + sqrt(1 - a_t) * eps`, evaluated for a different
//! timestep per example, which the sampling schedulers in candle do not
//! expose. Sampling itself goes through candle's DDIM scheduler.

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: String,
    #[serde(default = "default_train_timesteps")]
    pub num_train_timesteps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            num_train_timesteps: default_train_timesteps(),
        }
    }
}

fn default_beta_start() -> f64 {
    0.00085
}

fn default_beta_end() -> f64 {
    0.012
}

fn default_beta_schedule() -> String {
    "scaled_linear".to_string()
}

fn default_train_timesteps() -> usize {
    1000
}

#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scheduler config: {}", path.display()))?;
        let config: SchedulerConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse scheduler config: {}", path.display()))?;
        Self::new(&config)
    }

    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        ensure!(n > 1, "num_train_timesteps must be above 1, got {n}");
        let betas: Vec<f64> = match config.beta_schedule.as_str() {
            "linear" => linspace(config.beta_start, config.beta_end, n),
            "scaled_linear" => linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            other => bail!("Unsupported beta schedule: {other}"),
        };

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut acc = 1.0;
        for beta in betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        debug!(steps = n, last = acc, "Built noise schedule");
        Ok(Self { alphas_cumprod })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// One uniformly drawn timestep per example
    pub fn sample_timesteps<R: Rng>(&self, batch: usize, rng: &mut R) -> Vec<usize> {
        (0..batch)
            .map(|_| rng.gen_range(0..self.num_train_timesteps()))
            .collect()
    }

    /// Noise `original` (shape `(B, ...)`) to `timesteps[b]` for every example `b`
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let batch = original.dim(0)?;
        ensure!(
            timesteps.len() == batch,
            "got {} timesteps for a batch of {batch}",
            timesteps.len()
        );
        ensure!(
            timesteps.iter().all(|&t| t < self.num_train_timesteps()),
            "timestep out of range"
        );

        let mut coeff_shape = vec![batch];
        coeff_shape.resize(original.rank(), 1);

        let signal: Vec<f32> = timesteps
            .iter()
            .map(|&t| self.alphas_cumprod[t].sqrt() as f32)
            .collect();
        let noise_level: Vec<f32> = timesteps
            .iter()
            .map(|&t| (1.0 - self.alphas_cumprod[t]).sqrt() as f32)
            .collect();
        let device = original.device();
        let signal = Tensor::from_vec(signal, coeff_shape.as_slice(), device)?.to_dtype(original.dtype())?;
        let noise_level = Tensor::from_vec(noise_level, coeff_shape.as_slice(), device)?.to_dtype(original.dtype())?;

        let noised = (original.broadcast_mul(&signal)? + noise.broadcast_mul(&noise_level)?)?;
        Ok(noised)
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Standard normal tensor drawn from a seeded generator
///
/// Device RNGs cannot be seeded on every backend, so sampling noise that must
/// be reproducible is drawn on the host.
pub fn seeded_noise(shape: &[usize], seed: u64, device: &Device) -> Result<Tensor> {
    let mut rng = Pcg64::seed_from_u64(seed);
    let len: usize = shape.iter().product();
    let mut values = Vec::with_capacity(len + 1);
    while values.len() < len {
        // Box-Muller
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen::<f64>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = std::f64::consts::TAU * u2;
        values.push((radius * angle.cos()) as f32);
        values.push((radius * angle.sin()) as f32);
    }
    values.truncate(len);
    Ok(Tensor::from_vec(values, shape, device)?.to_dtype(DType::F32)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphas_cumprod_is_strictly_decreasing() {
        let schedule = NoiseSchedule::new(&SchedulerConfig::default()).unwrap();
        assert_eq!(schedule.num_train_timesteps(), 1000);
        assert!((schedule.alpha_cumprod(0) - (1.0 - 0.00085)).abs() < 1e-12);
        for t in 1..1000 {
            assert!(schedule.alpha_cumprod(t) < schedule.alpha_cumprod(t - 1));
        }
        assert!(schedule.alpha_cumprod(999) > 0.0);
    }

    #[test]
    fn test_scheduler_config_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler_config.json");
        std::fs::write(
            &path,
            r#"{"_class_name": "PNDMScheduler", "beta_start": 0.001, "beta_end": 0.02,
                "beta_schedule": "linear", "num_train_timesteps": 10, "skip_prk_steps": true}"#,
        )
        .unwrap();
        let schedule = NoiseSchedule::load(&path).unwrap();
        assert_eq!(schedule.num_train_timesteps(), 10);
        assert!((schedule.alpha_cumprod(0) - 0.999).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_beta_schedule_is_rejected() {
        let config = SchedulerConfig {
            beta_schedule: "cosine".to_string(),
            ..SchedulerConfig::default()
        };
        assert!(NoiseSchedule::new(&config).is_err());
    }

    #[test]
    fn test_add_noise_uses_per_example_timesteps() {
        let schedule = NoiseSchedule::new(&SchedulerConfig::default()).unwrap();
        let device = Device::Cpu;
        let original = Tensor::ones((2, 1, 2, 2), DType::F32, &device).unwrap();
        let noise = Tensor::zeros((2, 1, 2, 2), DType::F32, &device).unwrap();

        let noised = schedule.add_noise(&original, &noise, &[0, 999]).unwrap();
        let values: Vec<Vec<f32>> = noised.flatten_from(1).unwrap().to_vec2().unwrap();

        let expect0 = schedule.alpha_cumprod(0).sqrt() as f32;
        let expect1 = schedule.alpha_cumprod(999).sqrt() as f32;
        assert!(values[0].iter().all(|v| (v - expect0).abs() < 1e-6));
        assert!(values[1].iter().all(|v| (v - expect1).abs() < 1e-6));
    }

    #[test]
    fn test_add_noise_rejects_wrong_timestep_count() {
        let schedule = NoiseSchedule::new(&SchedulerConfig::default()).unwrap();
        let x = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(schedule.add_noise(&x, &x, &[1]).is_err());
        assert!(schedule.add_noise(&x, &x, &[1, 1000]).is_err());
    }

    #[test]
    fn test_seeded_noise_is_reproducible_and_roughly_standard() {
        let a = seeded_noise(&[4, 64, 64], 0, &Device::Cpu).unwrap();
        let b = seeded_noise(&[4, 64, 64], 0, &Device::Cpu).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);

        let n = a.len() as f64;
        let mean = a.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = a.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }
}
