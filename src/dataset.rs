//! Paired image / mask samples as tensors
//!
//! A split directory holds `ground_truth/` and `masks/` with matching file
//! names. Images become `(3, H, W)` tensors in `[-1, 1]`, masks `(1, H, W)`
//! tensors in `{0, 1}` where 1 marks the region to reconstruct.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::files;
use crate::masking::{GROUND_TRUTH_DIR, MASKS_DIR};
use crate::splitting::Split;

pub struct InpaintingSample {
    pub original: Tensor,
    pub masked: Tensor,
    pub mask: Tensor,
}

/// Stacked samples, `(B, C, H, W)`
pub struct InpaintingBatch {
    pub original: Tensor,
    pub masked: Tensor,
    pub mask: Tensor,
}

impl InpaintingBatch {
    pub fn len(&self) -> Result<usize> {
        Ok(self.original.dim(0)?)
    }
}

pub struct InpaintingDataset {
    image_paths: Vec<PathBuf>,
    mask_paths: Vec<PathBuf>,
    width: u32,
    height: u32,
}

impl InpaintingDataset {
    pub fn open(root: &Path, split: Split, image_size: [u32; 2]) -> Result<Self> {
        let split_dir = root.join(split.dir_name());
        let image_paths = files::list_files(&split_dir.join(GROUND_TRUTH_DIR), &[".png"])?;
        let mask_paths = files::list_files(&split_dir.join(MASKS_DIR), &[".png"])?;

        if image_paths.len() != mask_paths.len() {
            bail!(
                "Mismatch between number of images ({}) and masks ({}) in {}",
                image_paths.len(),
                mask_paths.len(),
                split_dir.display()
            );
        }
        for (image, mask) in image_paths.iter().zip(&mask_paths) {
            if files::file_name(image) != files::file_name(mask) {
                bail!(
                    "Image {} has no mask with the same name in {}",
                    files::file_name(image),
                    split_dir.display()
                );
            }
        }

        if image_paths.is_empty() {
            warn!(split = %split, dir = %split_dir.display(), "No samples found");
        } else {
            info!(split = %split, samples = image_paths.len(), "Opened inpainting dataset");
        }

        Ok(Self {
            image_paths,
            mask_paths,
            width: image_size[0],
            height: image_size[1],
        })
    }

    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }

    pub fn get(&self, index: usize, device: &Device) -> Result<InpaintingSample> {
        let image_path = &self.image_paths[index];
        let mask_path = &self.mask_paths[index];

        let image = image::open(image_path)
            .with_context(|| format!("Failed to load {}", image_path.display()))?
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb8();
        let mask = image::open(mask_path)
            .with_context(|| format!("Failed to load {}", mask_path.display()))?
            .resize_exact(self.width, self.height, FilterType::Nearest)
            .to_luma8();

        let original = image_to_tensor(&image, device)?;
        let mask = mask_to_tensor(&mask, device)?;
        let masked = apply_mask(&original, &mask)?;
        Ok(InpaintingSample { original, masked, mask })
    }

    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<InpaintingBatch> {
        let mut originals = Vec::with_capacity(indices.len());
        let mut maskeds = Vec::with_capacity(indices.len());
        let mut masks = Vec::with_capacity(indices.len());
        for &i in indices {
            let sample = self.get(i, device)?;
            originals.push(sample.original);
            maskeds.push(sample.masked);
            masks.push(sample.mask);
        }
        Ok(InpaintingBatch {
            original: Tensor::stack(&originals, 0)?,
            masked: Tensor::stack(&maskeds, 0)?,
            mask: Tensor::stack(&masks, 0)?,
        })
    }
}

/// Index batches for one epoch; shuffled when an RNG is given
pub fn epoch_batches<R: Rng>(len: usize, batch_size: usize, rng: Option<&mut R>) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..len).collect();
    if let Some(rng) = rng {
        order.shuffle(rng);
    }
    order.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
}

/// `(3, H, W)` in `[-1, 1]`
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    let tensor = Tensor::from_vec(image.as_raw().clone(), (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?;
    Ok(tensor)
}

/// `(1, H, W)`, 1 where the mask pixel is set
pub fn mask_to_tensor(mask: &GrayImage, device: &Device) -> Result<Tensor> {
    let (w, h) = mask.dimensions();
    let values: Vec<f32> = mask
        .pixels()
        .map(|p| if p.0[0] > 127 { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(values, (1, h as usize, w as usize), device)?)
}

/// `original * (1 - mask)`, broadcasting the mask over channels
pub fn apply_mask(original: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let keep = mask.affine(-1.0, 1.0)?;
    Ok(original.broadcast_mul(&keep)?)
}

/// Inverse of [`image_to_tensor`] for a `(3, H, W)` or `(1, 3, H, W)` tensor
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let tensor = if tensor.rank() == 4 { tensor.squeeze(0)? } else { tensor.clone() };
    let (_, h, w) = tensor.dims3()?;
    let pixels = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(w as u32, h as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaskConfig;
    use crate::masking::random_rectangle;
    use image::{Luma, Rgb};
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn write_split(root: &Path, names: &[&str], mask_names: &[&str]) {
        let gt = root.join("train").join(GROUND_TRUTH_DIR);
        let masks = root.join("train").join(MASKS_DIR);
        std::fs::create_dir_all(&gt).unwrap();
        std::fs::create_dir_all(&masks).unwrap();
        for name in names {
            RgbImage::from_pixel(16, 16, Rgb([255, 0, 128])).save(gt.join(name)).unwrap();
        }
        for name in mask_names {
            let mut mask = GrayImage::new(16, 16);
            for y in 0..8 {
                for x in 0..8 {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
            mask.save(masks.join(name)).unwrap();
        }
    }

    #[test]
    fn test_white_image_is_zero_inside_mask_and_unchanged_outside() {
        let device = Device::Cpu;
        let white = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
        let config = MaskConfig {
            min_mask_size_ratio: 0.3,
            max_mask_size_ratio: 0.5,
        };
        let (mask, rect) = random_rectangle(100, 100, &config, &mut Pcg64::seed_from_u64(5));
        assert!((900..=2500).contains(&rect.area()));

        let original = image_to_tensor(&white, &device).unwrap();
        let masked = apply_mask(&original, &mask_to_tensor(&mask, &device).unwrap()).unwrap();
        let values: Vec<Vec<Vec<f32>>> = masked.to_vec3().unwrap();

        for channel in &values {
            for (y, row) in channel.iter().enumerate() {
                for (x, &v) in row.iter().enumerate() {
                    if rect.contains(x as u32, y as u32) {
                        assert_eq!(v, 0.0);
                    } else {
                        assert!((v - 1.0).abs() < 1e-5);
                    }
                }
            }
        }
    }

    #[test]
    fn test_image_tensor_round_trip_is_lossless() {
        let mut img = RgbImage::new(5, 3);
        for (i, p) in img.pixels_mut().enumerate() {
            *p = Rgb([i as u8 * 17, 255 - i as u8, 3]);
        }
        let tensor = image_to_tensor(&img, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 3, 5]);
        assert_eq!(tensor_to_image(&tensor).unwrap(), img);
    }

    #[test]
    fn test_dataset_batches_have_expected_shapes() {
        let root = tempfile::tempdir().unwrap();
        write_split(root.path(), &["a.png", "b.png", "c.png"], &["a.png", "b.png", "c.png"]);

        let dataset = InpaintingDataset::open(root.path(), Split::Train, [8, 8]).unwrap();
        assert_eq!(dataset.len(), 3);

        let batch = dataset.batch(&[0, 2], &Device::Cpu).unwrap();
        assert_eq!(batch.original.dims(), &[2, 3, 8, 8]);
        assert_eq!(batch.masked.dims(), &[2, 3, 8, 8]);
        assert_eq!(batch.mask.dims(), &[2, 1, 8, 8]);
        assert_eq!(batch.len().unwrap(), 2);

        let mask: Vec<f32> = batch.mask.flatten_all().unwrap().to_vec1().unwrap();
        assert!(mask.iter().all(|&v| v == 0.0 || v == 1.0));
        assert_eq!(mask.iter().filter(|&&v| v == 1.0).count(), 2 * 16);
    }

    #[test]
    fn test_mismatched_counts_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_split(root.path(), &["a.png", "b.png"], &["a.png"]);
        assert!(InpaintingDataset::open(root.path(), Split::Train, [8, 8]).is_err());
    }

    #[test]
    fn test_epoch_batches_cover_every_index_once() {
        let mut rng = Pcg64::seed_from_u64(1);
        let batches = epoch_batches(7, 3, Some(&mut rng));
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        let mut all: Vec<usize> = batches.into_iter().flatten().collect();
        all.sort();
        assert_eq!(all, (0..7).collect::<Vec<_>>());

        let ordered = epoch_batches::<Pcg64>(4, 2, None);
        assert_eq!(ordered, vec![vec![0, 1], vec![2, 3]]);
    }
}
