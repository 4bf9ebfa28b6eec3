//! Masked L1 loss for the size and offset heads
//!
//! The dense head output is sampled at each object's center cell, then
//! compared against the per-object target. Padding slots are zeroed by
//! the mask. The mask is repeated over the channel axis before it is
//! summed, so the normalizer counts every object once per channel.

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};

use crate::config::RegL1Config;

/// L1 regression loss over a dense (batch, height, width, channels) head
#[derive(Debug, Clone, Default)]
pub struct RegL1Loss {
    config: RegL1Config,
}

impl RegL1Loss {
    /// Create with the default normalizer epsilon (1e-4)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom parameters
    pub fn with_config(config: RegL1Config) -> Self {
        Self { config }
    }

    /// Compute the loss
    ///
    /// # Arguments
    /// * `y_pred` - Dense head output (batch, height, width, channels)
    /// * `y_true` - Per-object targets (batch, max_objects, channels)
    /// * `indices` - Flat cell index per object (batch, max_objects), any numeric dtype
    /// * `mask` - 1 for real objects, 0 for padding (batch, max_objects)
    ///
    /// # Returns
    /// * Rank-0 tensor in the dtype of `y_pred`
    pub fn forward(
        &self,
        y_pred: &Tensor,
        y_true: &Tensor,
        indices: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let (b, h, w, c) = y_pred.dims4()?;
        let (ib, k) = indices.dims2()?;
        ensure!(ib == b, "reg l1 loss: indices batch {} != prediction batch {}", ib, b);
        ensure!(
            mask.dims() == indices.dims(),
            "reg l1 loss: mask shape {:?} does not match indices {:?}",
            mask.dims(),
            indices.dims()
        );
        ensure!(
            y_true.dims() == &[b, k, c],
            "reg l1 loss: target shape {:?}, expected ({}, {}, {})",
            y_true.dims(),
            b,
            k,
            c
        );

        let dtype = y_pred.dtype();
        let flat = y_pred.reshape((b, h * w, c))?;
        let gathered = gather_rows(&flat, indices)?;

        let mask = mask
            .to_dtype(dtype)?
            .unsqueeze(2)?
            .broadcast_as((b, k, c))?
            .contiguous()?;
        let y_true = y_true.to_dtype(dtype)?;

        let total = (y_true.mul(&mask)? - gathered.mul(&mask)?)?
            .abs()?
            .sum_all()?;
        let norm = (mask.sum_all()? + self.config.norm_eps)?;

        Ok((total / norm)?)
    }
}

/// L1 loss with the default normalizer epsilon
pub fn reg_l1_loss(
    y_pred: &Tensor,
    y_true: &Tensor,
    indices: &Tensor,
    mask: &Tensor,
) -> Result<Tensor> {
    RegL1Loss::new().forward(y_pred, y_true, indices, mask)
}

/// Gather `(batch, k, channels)` rows out of `(batch, cells, channels)`
///
/// Each batch item uses its own row of `indices`. Indices outside
/// `[0, cells)` are an error rather than a silent clamp.
pub fn gather_rows(flat: &Tensor, indices: &Tensor) -> Result<Tensor> {
    let (b, cells, c) = flat.dims3()?;
    let (_, k) = indices.dims2()?;

    let raw: Vec<i64> = indices.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
    if let Some((pos, bad)) = raw
        .iter()
        .enumerate()
        .find(|&(_, &i)| i < 0 || i as usize >= cells)
    {
        anyhow::bail!(
            "index {} at batch {} slot {} is outside the {} heatmap cells",
            bad,
            pos / k.max(1),
            pos % k.max(1),
            cells
        );
    }
    let idx: Vec<u32> = raw.into_iter().map(|i| i as u32).collect();

    let idx = Tensor::from_vec(idx, (b, k), flat.device())?
        .unsqueeze(2)?
        .broadcast_as((b, k, c))?
        .contiguous()?;
    Ok(flat.contiguous()?.gather(&idx, 1)?)
}
