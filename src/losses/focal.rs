//! Penalty-reduced focal loss for the center heatmap
//!
//! Positive cells are those where the target heatmap is exactly 1.0.
//! Every other cell is a negative whose penalty is reduced by
//! `(1 - target)^beta`, so cells close to a center (target close to 1)
//! cost less when predicted high.
//!
//! ```text
//! pos = -log(clip(p)) * (1 - p)^alpha            where y == 1
//! neg = -log(clip(1 - p)) * p^alpha * (1 - y)^beta  where y < 1
//! loss = (sum(pos) + sum(neg)) / num_pos   if num_pos > 0
//!      = sum(neg)                          otherwise
//! ```

use anyhow::{ensure, Result};
use candle_core::Tensor;
use tracing::debug;

use crate::config::FocalLossConfig;
use crate::utils::tensor_utils::{one_minus, pow_scalar, scalar_f32};

/// Focal loss over the heatmap head
#[derive(Debug, Clone, Default)]
pub struct FocalLoss {
    config: FocalLossConfig,
}

impl FocalLoss {
    /// Create with default parameters (alpha 2, beta 4, eps 1e-4)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom parameters
    pub fn with_config(config: FocalLossConfig) -> Self {
        Self { config }
    }

    /// Parameters in use
    pub fn config(&self) -> &FocalLossConfig {
        &self.config
    }

    /// Compute the loss
    ///
    /// # Arguments
    /// * `hm_pred` - Predicted heatmap in [0, 1], any shape
    /// * `hm_true` - Target heatmap of the same shape
    ///
    /// # Returns
    /// * Rank-0 tensor in the dtype of `hm_pred`
    pub fn forward(&self, hm_pred: &Tensor, hm_true: &Tensor) -> Result<Tensor> {
        ensure!(
            hm_pred.dims() == hm_true.dims(),
            "focal loss: prediction shape {:?} does not match target {:?}",
            hm_pred.dims(),
            hm_true.dims()
        );

        let dtype = hm_pred.dtype();
        let hm_true = hm_true.to_dtype(dtype)?;
        let eps = self.config.clip_eps;

        let pos_mask = hm_true.eq(1.0)?.to_dtype(dtype)?;
        let neg_mask = hm_true.lt(1.0)?.to_dtype(dtype)?;
        let neg_weights = pow_scalar(&one_minus(&hm_true)?, self.config.beta)?;

        let pos_loss = hm_pred
            .clamp(eps, 1.0 - eps)?
            .log()?
            .neg()?
            .mul(&pow_scalar(&one_minus(hm_pred)?, self.config.alpha)?)?
            .mul(&pos_mask)?;

        let neg_loss = one_minus(hm_pred)?
            .clamp(eps, 1.0 - eps)?
            .log()?
            .neg()?
            .mul(&pow_scalar(hm_pred, self.config.alpha)?)?
            .mul(&neg_weights)?
            .mul(&neg_mask)?;

        let num_pos = pos_mask.sum_all()?;
        let pos_loss = pos_loss.sum_all()?;
        let neg_loss = neg_loss.sum_all()?;

        let num_pos_value = scalar_f32(&num_pos)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                num_pos = num_pos_value,
                pos = scalar_f32(&pos_loss)?,
                neg = scalar_f32(&neg_loss)?,
                "focal loss terms"
            );
        }

        if num_pos_value > 0.0 {
            Ok(((pos_loss + neg_loss)? / num_pos)?)
        } else {
            Ok(neg_loss)
        }
    }
}

/// Focal loss with default parameters
pub fn focal_loss(hm_pred: &Tensor, hm_true: &Tensor) -> Result<Tensor> {
    FocalLoss::new().forward(hm_pred, hm_true)
}
