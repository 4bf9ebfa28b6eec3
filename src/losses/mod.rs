//! CenterNet training losses
//!
//! - Heatmap head: penalty-reduced focal loss
//! - Size (wh) and offset (reg) heads: masked L1 at object centers
//!
//! The total is a weighted sum, `hm + 0.1 * wh + reg` by default.

mod focal;
mod reg_l1;

pub use focal::{focal_loss, FocalLoss};
pub use reg_l1::{gather_rows, reg_l1_loss, RegL1Loss};

use anyhow::Result;
use candle_core::Tensor;
use std::fmt;
use tracing::debug;

use crate::batch::{HeadOutputs, TrainingTargets};
use crate::config::{LossConfig, LossWeights};
use crate::utils::tensor_utils::scalar_f32;

/// Losses of one batch, each already multiplied by its head weight
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Sum of the three weighted head losses
    pub total: Tensor,
    /// Heatmap focal loss
    pub hm_loss: Tensor,
    /// Size L1 loss
    pub wh_loss: Tensor,
    /// Offset L1 loss
    pub reg_loss: Tensor,
}

impl LossOutput {
    /// Plain values for logging
    pub fn summary(&self) -> Result<LossSummary> {
        Ok(LossSummary {
            total: scalar_f32(&self.total)?,
            hm: scalar_f32(&self.hm_loss)?,
            wh: scalar_f32(&self.wh_loss)?,
            reg: scalar_f32(&self.reg_loss)?,
        })
    }
}

/// Loss values read back from the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSummary {
    /// Weighted total
    pub total: f32,
    /// Heatmap term
    pub hm: f32,
    /// Size term
    pub wh: f32,
    /// Offset term
    pub reg: f32,
}

impl fmt::Display for LossSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={:.4} hm={:.4} wh={:.4} reg={:.4}",
            self.total, self.hm, self.wh, self.reg
        )
    }
}

/// Unweighted per-head losses, as printed by the debug driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadLosses {
    /// Heatmap focal loss
    pub focal: f32,
    /// Size L1 loss
    pub wh: f32,
    /// Offset L1 loss
    pub reg: f32,
}

impl fmt::Display for HeadLosses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "focal_loss: {}", self.focal)?;
        writeln!(f, "wh_loss: {}", self.wh)?;
        write!(f, "reg_loss: {}", self.reg)
    }
}

/// Combined CenterNet loss
#[derive(Debug, Clone, Default)]
pub struct CenterNetLoss {
    focal: FocalLoss,
    reg_l1: RegL1Loss,
    weights: LossWeights,
}

impl CenterNetLoss {
    /// Create with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a loss configuration
    pub fn with_config(config: &LossConfig) -> Self {
        Self {
            focal: FocalLoss::with_config(config.focal.clone()),
            reg_l1: RegL1Loss::with_config(config.reg_l1.clone()),
            weights: config.weights.clone(),
        }
    }

    /// Unweighted (focal, wh, reg) loss tensors
    fn head_tensors(
        &self,
        preds: &HeadOutputs,
        targets: &TrainingTargets,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        targets.check_shapes()?;
        preds.check_shapes(targets)?;

        let hm = self.focal.forward(&preds.hm_pred, &targets.hm_true)?;
        let wh = self.reg_l1.forward(
            &preds.wh_pred,
            &targets.wh_true,
            &targets.indices,
            &targets.reg_mask,
        )?;
        let reg = self.reg_l1.forward(
            &preds.reg_pred,
            &targets.reg_true,
            &targets.indices,
            &targets.reg_mask,
        )?;
        Ok((hm, wh, reg))
    }

    /// Compute all losses for one batch
    pub fn forward(&self, preds: &HeadOutputs, targets: &TrainingTargets) -> Result<LossOutput> {
        let (hm, wh, reg) = self.head_tensors(preds, targets)?;

        let hm_loss = (hm * self.weights.hm)?;
        let wh_loss = (wh * self.weights.wh)?;
        let reg_loss = (reg * self.weights.reg)?;
        let total = ((&hm_loss + &wh_loss)? + &reg_loss)?;

        let output = LossOutput {
            total,
            hm_loss,
            wh_loss,
            reg_loss,
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("loss: {}", output.summary()?);
        }
        Ok(output)
    }

    /// Each head's loss without its weight
    pub fn head_losses(&self, preds: &HeadOutputs, targets: &TrainingTargets) -> Result<HeadLosses> {
        let (focal, wh, reg) = self.head_tensors(preds, targets)?;
        Ok(HeadLosses {
            focal: scalar_f32(&focal)?,
            wh: scalar_f32(&wh)?,
            reg: scalar_f32(&reg)?,
        })
    }
}
