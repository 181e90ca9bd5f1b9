//! Reconstruction quality metrics on 8-bit RGB images

use anyhow::{ensure, Result};
use image::{GrayImage, RgbImage};

const DATA_RANGE: f64 = 255.0;
const SSIM_WINDOW: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

fn psnr_from_mse(mse: f64) -> f64 {
    if mse == 0.0 {
        f64::INFINITY
    } else {
        10.0 * (DATA_RANGE * DATA_RANGE / mse).log10()
    }
}

fn check_dimensions(a: &RgbImage, b: &RgbImage) -> Result<()> {
    ensure!(
        a.dimensions() == b.dimensions(),
        "image sizes differ: {:?} vs {:?}",
        a.dimensions(),
        b.dimensions()
    );
    Ok(())
}

/// Peak signal-to-noise ratio over every pixel and channel; infinite for identical images
pub fn psnr(reference: &RgbImage, test: &RgbImage) -> Result<f64> {
    check_dimensions(reference, test)?;
    let n = reference.as_raw().len() as f64;
    let sum: f64 = reference
        .as_raw()
        .iter()
        .zip(test.as_raw())
        .map(|(&a, &b)| (a as f64 - b as f64).powi(2))
        .sum();
    Ok(psnr_from_mse(sum / n))
}

/// PSNR restricted to pixels where `mask` is set; `None` when the mask is empty
pub fn masked_psnr(reference: &RgbImage, test: &RgbImage, mask: &GrayImage) -> Result<Option<f64>> {
    check_dimensions(reference, test)?;
    ensure!(
        mask.dimensions() == reference.dimensions(),
        "mask size {:?} differs from image size {:?}",
        mask.dimensions(),
        reference.dimensions()
    );

    let mut sum = 0.0;
    let mut count = 0usize;
    for ((a, b), m) in reference.pixels().zip(test.pixels()).zip(mask.pixels()) {
        if m.0[0] > 127 {
            for c in 0..3 {
                sum += (a.0[c] as f64 - b.0[c] as f64).powi(2);
            }
            count += 3;
        }
    }
    if count == 0 {
        return Ok(None);
    }
    Ok(Some(psnr_from_mse(sum / count as f64)))
}

/// Mean structural similarity, 7×7 uniform window, averaged over channels
///
/// Only positions where the window fits entirely inside the image contribute.
/// Covariances use the unbiased estimate over the window.
pub fn ssim(reference: &RgbImage, test: &RgbImage) -> Result<f64> {
    check_dimensions(reference, test)?;
    let (w, h) = reference.dimensions();
    let (w, h) = (w as usize, h as usize);
    ensure!(
        w >= SSIM_WINDOW && h >= SSIM_WINDOW,
        "SSIM needs at least {SSIM_WINDOW}x{SSIM_WINDOW} pixels, got {w}x{h}"
    );

    let mut total = 0.0;
    for c in 0..3 {
        let a: Vec<f64> = reference.pixels().map(|p| p.0[c] as f64).collect();
        let b: Vec<f64> = test.pixels().map(|p| p.0[c] as f64).collect();
        total += ssim_channel(&a, &b, w, h);
    }
    Ok(total / 3.0)
}

fn ssim_channel(a: &[f64], b: &[f64], w: usize, h: usize) -> f64 {
    let c1 = (SSIM_K1 * DATA_RANGE).powi(2);
    let c2 = (SSIM_K2 * DATA_RANGE).powi(2);
    let np = (SSIM_WINDOW * SSIM_WINDOW) as f64;
    let cov_norm = np / (np - 1.0);

    let integrals = [
        Integral::new(w, h, |i| a[i]),
        Integral::new(w, h, |i| b[i]),
        Integral::new(w, h, |i| a[i] * a[i]),
        Integral::new(w, h, |i| b[i] * b[i]),
        Integral::new(w, h, |i| a[i] * b[i]),
    ];

    let mut sum = 0.0;
    let mut count = 0usize;
    for y in 0..=h - SSIM_WINDOW {
        for x in 0..=w - SSIM_WINDOW {
            let [ma, mb, maa, mbb, mab] = integrals.each_ref().map(|s| s.window_sum(x, y, SSIM_WINDOW) / np);
            let var_a = cov_norm * (maa - ma * ma);
            let var_b = cov_norm * (mbb - mb * mb);
            let cov = cov_norm * (mab - ma * mb);
            let numerator = (2.0 * ma * mb + c1) * (2.0 * cov + c2);
            let denominator = (ma * ma + mb * mb + c1) * (var_a + var_b + c2);
            sum += numerator / denominator;
            count += 1;
        }
    }
    sum / count as f64
}

/// Summed-area table for O(1) window sums
struct Integral {
    table: Vec<f64>,
    stride: usize,
}

impl Integral {
    fn new(w: usize, h: usize, value: impl Fn(usize) -> f64) -> Self {
        let stride = w + 1;
        let mut table = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0.0;
            for x in 0..w {
                row += value(y * w + x);
                table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row;
            }
        }
        Self { table, stride }
    }

    fn window_sum(&self, x: usize, y: usize, size: usize) -> f64 {
        let at = |x: usize, y: usize| self.table[y * self.stride + x];
        at(x + size, y + size) - at(x, y + size) - at(x + size, y) + at(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8]))
    }

    #[test]
    fn test_psnr_of_identical_images_is_infinite() {
        let img = gradient(16, 16);
        assert!(psnr(&img, &img).unwrap().is_infinite());
    }

    #[test]
    fn test_psnr_known_value() {
        let a = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        let b = RgbImage::from_pixel(8, 8, Rgb([10, 10, 10]));
        let expected = 10.0 * (255.0f64 * 255.0 / 100.0).log10();
        assert!((psnr(&a, &b).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_ssim_bounds() {
        let img = gradient(32, 24);
        assert!((ssim(&img, &img).unwrap() - 1.0).abs() < 1e-9);

        let mut noisy = img.clone();
        for (i, p) in noisy.pixels_mut().enumerate() {
            if i % 3 == 0 {
                *p = Rgb([255 - p.0[0], p.0[1], 0]);
            }
        }
        let score = ssim(&img, &noisy).unwrap();
        assert!(score < 0.95 && score > -1.0, "ssim {score}");
    }

    #[test]
    fn test_metrics_reject_mismatched_sizes() {
        assert!(psnr(&gradient(8, 8), &gradient(9, 8)).is_err());
        assert!(ssim(&gradient(4, 4), &gradient(4, 4)).is_err());
    }

    #[test]
    fn test_masked_psnr_only_counts_masked_pixels() {
        let reference = RgbImage::from_pixel(10, 10, Rgb([100, 100, 100]));
        let mut test = reference.clone();
        let mut mask = GrayImage::new(10, 10);
        for x in 0..5 {
            mask.put_pixel(x, 0, Luma([255]));
            test.put_pixel(x, 0, Rgb([110, 110, 110]));
        }
        // error outside the mask is ignored
        test.put_pixel(9, 9, Rgb([0, 0, 0]));

        let expected = 10.0 * (255.0f64 * 255.0 / 100.0).log10();
        let score = masked_psnr(&reference, &test, &mask).unwrap().unwrap();
        assert!((score - expected).abs() < 1e-9);

        let empty = GrayImage::new(10, 10);
        assert!(masked_psnr(&reference, &test, &empty).unwrap().is_none());
    }
}
