//! Synthetic batches for exercising the losses without a dataset
//!
//! Targets are built the way a CenterNet generator builds them: every
//! object splats a gaussian (peak exactly 1.0) into its class channel,
//! and records its size, sub-cell offset and flat center index.

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::sigmoid;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::dump::{BatchSource, Predictor};
use crate::batch::{HeadOutputs, TrainingTargets};
use crate::utils::tensor_utils::one_minus;

/// Shape of generated batches
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Images per batch
    pub batch_size: usize,
    /// Heatmap height
    pub height: usize,
    /// Heatmap width
    pub width: usize,
    /// Number of classes (heatmap channels)
    pub num_classes: usize,
    /// Object slots per image
    pub max_objects: usize,
    /// Minimum IoU used to size the gaussian radius
    pub min_overlap: f32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            height: 32,
            width: 32,
            num_classes: 4,
            max_objects: 8,
            min_overlap: 0.7,
        }
    }
}

impl SyntheticConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.height >= 4 && self.width >= 4, "heatmap must be at least 4x4");
        ensure!(self.num_classes > 0, "num_classes must be positive");
        ensure!(self.max_objects > 0, "max_objects must be positive");
        ensure!(
            self.min_overlap > 0.0 && self.min_overlap < 1.0,
            "min_overlap must be in (0, 1)"
        );
        Ok(())
    }
}

/// Radius at which a box shifted by the radius still keeps `min_overlap` IoU
///
/// Smallest root of the three corner-shift cases from CornerNet.
pub fn gaussian_radius(height: f32, width: f32, min_overlap: f32) -> f32 {
    let a1 = 1.0;
    let b1 = height + width;
    let c1 = width * height * (1.0 - min_overlap) / (1.0 + min_overlap);
    let r1 = (b1 + (b1 * b1 - 4.0 * a1 * c1).sqrt()) / 2.0;

    let a2 = 4.0;
    let b2 = 2.0 * (height + width);
    let c2 = (1.0 - min_overlap) * width * height;
    let r2 = (b2 + (b2 * b2 - 4.0 * a2 * c2).sqrt()) / 2.0;

    let a3 = 4.0 * min_overlap;
    let b3 = -2.0 * min_overlap * (height + width);
    let c3 = (min_overlap - 1.0) * width * height;
    let r3 = (b3 + (b3 * b3 - 4.0 * a3 * c3).sqrt()) / 2.0;

    r1.min(r2).min(r3)
}

/// Splat a gaussian of integer `radius` centered on `(cx, cy)` into one channel
///
/// Overlapping objects keep the elementwise maximum.
fn draw_gaussian(
    heatmap: &mut [f32],
    (height, width, channels): (usize, usize, usize),
    channel: usize,
    (cx, cy): (usize, usize),
    radius: usize,
) {
    let sigma = (2 * radius + 1) as f32 / 6.0;
    let r = radius as isize;
    for dy in -r..=r {
        let y = cy as isize + dy;
        if y < 0 || y >= height as isize {
            continue;
        }
        for dx in -r..=r {
            let x = cx as isize + dx;
            if x < 0 || x >= width as isize {
                continue;
            }
            let g = (-((dx * dx + dy * dy) as f32) / (2.0 * sigma * sigma)).exp();
            let i = (y as usize * width + x as usize) * channels + channel;
            if g > heatmap[i] {
                heatmap[i] = g;
            }
        }
    }
}

/// Seeded generator of valid training targets
pub struct SyntheticBatches {
    config: SyntheticConfig,
    rng: StdRng,
    remaining: usize,
    device: Device,
}

impl SyntheticBatches {
    /// Create a source yielding `num_batches` batches
    pub fn new(config: SyntheticConfig, num_batches: usize, seed: u64, device: &Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            remaining: num_batches,
            device: device.clone(),
        })
    }

    /// Generate one batch
    pub fn generate(&mut self) -> Result<TrainingTargets> {
        let SyntheticConfig {
            batch_size: b,
            height: h,
            width: w,
            num_classes: c,
            max_objects: k,
            min_overlap,
        } = self.config.clone();

        let mut hm = vec![0f32; b * h * w * c];
        let mut wh = vec![0f32; b * k * 2];
        let mut reg = vec![0f32; b * k * 2];
        let mut mask = vec![0f32; b * k];
        let mut indices = vec![0i64; b * k];

        let plane = h * w * c;
        for item in 0..b {
            let num_objects = self.rng.gen_range(0..=k);
            for slot in 0..num_objects {
                let class = self.rng.gen_range(0..c);
                let box_w: f32 = self.rng.gen_range(1.0..(w as f32 / 2.0));
                let box_h: f32 = self.rng.gen_range(1.0..(h as f32 / 2.0));
                let cx: f32 = self.rng.gen_range(0.0..w as f32);
                let cy: f32 = self.rng.gen_range(0.0..h as f32);
                let (cx_int, cy_int) = (cx.floor() as usize, cy.floor() as usize);

                let radius = gaussian_radius(box_h.ceil(), box_w.ceil(), min_overlap).max(0.0) as usize;
                draw_gaussian(
                    &mut hm[item * plane..(item + 1) * plane],
                    (h, w, c),
                    class,
                    (cx_int, cy_int),
                    radius,
                );

                let j = item * k + slot;
                wh[2 * j] = box_w;
                wh[2 * j + 1] = box_h;
                reg[2 * j] = cx - cx_int as f32;
                reg[2 * j + 1] = cy - cy_int as f32;
                indices[j] = (cy_int * w + cx_int) as i64;
                mask[j] = 1.0;
            }
            debug!(item, num_objects, "synthetic targets");
        }

        let device = &self.device;
        Ok(TrainingTargets {
            hm_true: Tensor::from_vec(hm, (b, h, w, c), device)?,
            wh_true: Tensor::from_vec(wh, (b, k, 2), device)?,
            reg_true: Tensor::from_vec(reg, (b, k, 2), device)?,
            reg_mask: Tensor::from_vec(mask, (b, k), device)?,
            indices: Tensor::from_vec(indices, (b, k), device)?,
        })
    }
}

impl BatchSource for SyntheticBatches {
    fn next_batch(&mut self) -> Result<Option<TrainingTargets>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.generate().map(Some)
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

/// Predictor that perturbs the targets instead of running a network
///
/// The heatmap is perturbed in logit space and squashed back with a
/// sigmoid, so it stays in (0, 1). Size and offset maps hold the target
/// at object centers plus noise, and noise elsewhere.
pub struct NoisyPredictor {
    rng: StdRng,
    /// Half-width of the uniform logit noise on the heatmap
    pub hm_noise: f32,
    /// Half-width of the uniform noise on size and offset maps
    pub reg_noise: f32,
}

impl NoisyPredictor {
    /// Create with a fixed seed
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            hm_noise: 1.0,
            reg_noise: 0.25,
        }
    }

    fn uniform(&mut self, n: usize, half_width: f32) -> Vec<f32> {
        if half_width <= 0.0 {
            return vec![0.0; n];
        }
        (0..n)
            .map(|_| self.rng.gen_range(-half_width..half_width))
            .collect()
    }

    /// Dense (b, h, w, 2) map with `values` written at each masked center
    fn dense_map(
        &mut self,
        (b, h, w): (usize, usize, usize),
        values: &Tensor,
        indices: &[i64],
        mask: &[f32],
        device: &Device,
    ) -> Result<Tensor> {
        let (_, k, ch) = values.dims3()?;
        let values: Vec<f32> = values.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let mut dense = self.uniform(b * h * w * ch, self.reg_noise);
        for item in 0..b {
            for slot in 0..k {
                let j = item * k + slot;
                if mask[j] == 0.0 {
                    continue;
                }
                let index = indices[j];
                if index < 0 || index as usize >= h * w {
                    anyhow::bail!(
                        "index {} at batch {} slot {} is outside the {} heatmap cells",
                        index,
                        item,
                        slot,
                        h * w
                    );
                }
                let cell = item * h * w + index as usize;
                // noise is already in place; a later object on the same cell wins
                for c in 0..ch {
                    let noise = self.rng.gen_range(-1.0f32..1.0) * self.reg_noise;
                    dense[cell * ch + c] = values[j * ch + c] + noise;
                }
            }
        }
        Ok(Tensor::from_vec(dense, (b, h, w, ch), device)?)
    }
}

impl Predictor for NoisyPredictor {
    fn predict(&mut self, targets: &TrainingTargets) -> Result<HeadOutputs> {
        let device = targets.hm_true.device().clone();
        let (b, h, w, c) = targets.hm_true.dims4()?;

        let p = targets.hm_true.to_dtype(DType::F32)?.clamp(0.01f32, 0.99f32)?;
        let logits = (p.log()? - one_minus(&p)?.log()?)?;
        let noise = Tensor::from_vec(self.uniform(b * h * w * c, self.hm_noise), (b, h, w, c), &device)?;
        let hm_pred = sigmoid(&(logits + noise)?)?;

        let indices: Vec<i64> = targets.indices.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
        let mask: Vec<f32> = targets.reg_mask.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let wh_pred = self.dense_map((b, h, w), &targets.wh_true, &indices, &mask, &device)?;
        let reg_pred = self.dense_map((b, h, w), &targets.reg_true, &indices, &mask, &device)?;

        Ok(HeadOutputs {
            hm_pred,
            wh_pred,
            reg_pred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::CenterNetLoss;
    use crate::utils::tensor_utils::count_equal;

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            batch_size: 3,
            height: 16,
            width: 12,
            num_classes: 2,
            max_objects: 5,
            min_overlap: 0.7,
        }
    }

    #[test]
    fn test_gaussian_radius_grows_with_box() {
        let small = gaussian_radius(4.0, 4.0, 0.7);
        let large = gaussian_radius(40.0, 40.0, 0.7);
        assert!(small > 0.0);
        assert!(large > small);
    }

    #[test]
    fn test_draw_gaussian_peak_and_max_merge() {
        let mut hm = vec![0f32; 5 * 5];
        draw_gaussian(&mut hm, (5, 5, 1), 0, (2, 2), 1);
        assert_eq!(hm[2 * 5 + 2], 1.0);
        assert!(hm[2 * 5 + 3] > 0.0 && hm[2 * 5 + 3] < 1.0);
        assert_eq!(hm[0], 0.0);

        let before = hm[2 * 5 + 3];
        draw_gaussian(&mut hm, (5, 5, 1), 0, (0, 0), 1);
        assert_eq!(hm[2 * 5 + 3], before);
        assert_eq!(hm[0], 1.0);
    }

    #[test]
    fn test_draw_gaussian_clips_at_border() {
        let mut hm = vec![0f32; 3 * 3 * 2];
        draw_gaussian(&mut hm, (3, 3, 2), 1, (0, 0), 4);
        assert_eq!(hm[1], 1.0);
        // channel 0 untouched
        assert!(hm.iter().step_by(2).all(|&v| v == 0.0));
    }

    #[test]
    fn test_generated_targets_are_consistent() {
        let device = Device::Cpu;
        let mut source = SyntheticBatches::new(small(), 2, 7, &device).unwrap();
        let targets = source.next_batch().unwrap().unwrap();
        targets.check_shapes().unwrap();

        let indices: Vec<i64> = targets.indices.flatten_all().unwrap().to_vec1().unwrap();
        assert!(indices.iter().all(|&i| i >= 0 && (i as usize) < 16 * 12));

        // every object has a peak, duplicates may share one
        let peaks = count_equal(&targets.hm_true, 1.0).unwrap();
        let objects = targets.num_objects().unwrap();
        assert!(peaks <= objects);
        assert!(objects == 0 || peaks > 0);

        let reg: Vec<f32> = targets.reg_true.flatten_all().unwrap().to_vec1().unwrap();
        assert!(reg.iter().all(|&r| (0.0..1.0).contains(&r)));

        assert_eq!(source.len_hint(), Some(1));
        assert!(source.next_batch().unwrap().is_some());
        assert!(source.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_same_seed_same_batch() {
        let device = Device::Cpu;
        let a = SyntheticBatches::new(small(), 1, 42, &device).unwrap().generate().unwrap();
        let b = SyntheticBatches::new(small(), 1, 42, &device).unwrap().generate().unwrap();
        let a: Vec<f32> = a.hm_true.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.hm_true.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_noisy_predictor_gives_finite_losses() {
        let device = Device::Cpu;
        let targets = SyntheticBatches::new(small(), 1, 3, &device).unwrap().generate().unwrap();
        let preds = NoisyPredictor::new(3).predict(&targets).unwrap();
        preds.check_shapes(&targets).unwrap();

        let hm: Vec<f32> = preds.hm_pred.flatten_all().unwrap().to_vec1().unwrap();
        assert!(hm.iter().all(|&v| v > 0.0 && v < 1.0));

        let losses = CenterNetLoss::new().head_losses(&preds, &targets).unwrap();
        assert!(losses.focal.is_finite() && losses.focal > 0.0);
        assert!(losses.wh.is_finite());
        // offsets lie in [0, 1) and noise is at most 0.25
        assert!(losses.reg <= 1.25);
    }

    #[test]
    fn test_noisy_predictor_rejects_out_of_range_index() {
        let device = Device::Cpu;
        let mut targets = SyntheticBatches::new(
            SyntheticConfig {
                batch_size: 1,
                height: 4,
                width: 4,
                num_classes: 1,
                max_objects: 1,
                min_overlap: 0.7,
            },
            1,
            0,
            &device,
        )
        .unwrap()
        .generate()
        .unwrap();
        targets.reg_mask = Tensor::ones((1, 1), DType::F32, &device).unwrap();

        for bad in [16i64, -1] {
            targets.indices = Tensor::new(&[[bad]], &device).unwrap();
            let err = NoisyPredictor::new(0).predict(&targets).unwrap_err();
            assert!(err.to_string().contains("batch 0 slot 0"), "{}", err);
        }

        targets.indices = Tensor::new(&[[15i64]], &device).unwrap();
        assert!(NoisyPredictor::new(0).predict(&targets).is_ok());
    }

    #[test]
    fn test_noiseless_predictor_matches_regression_targets() {
        let device = Device::Cpu;
        let targets = SyntheticBatches::new(small(), 1, 11, &device).unwrap().generate().unwrap();
        let mut predictor = NoisyPredictor::new(11);
        predictor.reg_noise = 0.0;
        let preds = predictor.predict(&targets).unwrap();

        let losses = CenterNetLoss::new().head_losses(&preds, &targets).unwrap();
        // objects sharing a center cell overwrite each other, so only check
        // when every index is unique
        let indices: Vec<i64> = targets.indices.flatten_all().unwrap().to_vec1().unwrap();
        let mask: Vec<f32> = targets.reg_mask.flatten_all().unwrap().to_vec1().unwrap();
        let mut seen = std::collections::HashSet::new();
        let unique = indices
            .iter()
            .zip(mask.iter())
            .enumerate()
            .filter(|&(_, (_, &m))| m > 0.0)
            .all(|(j, (&i, _))| seen.insert((j / 5, i)));
        if unique {
            assert!(losses.reg < 1e-5);
            assert!(losses.wh < 1e-4);
        }
    }
}
