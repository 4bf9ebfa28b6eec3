//! Training batch containers
//!
//! Channels-last layout, as produced by the detection heads:
//! - heatmaps: (batch, height, width, classes)
//! - dense size/offset maps: (batch, height, width, 2)
//! - per-object targets: (batch, max_objects, 2)
//! - mask and flat cell indices: (batch, max_objects)

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};

/// Ground-truth targets for one batch
#[derive(Debug, Clone)]
pub struct TrainingTargets {
    /// Gaussian-splatted center heatmap, peaks exactly 1.0
    pub hm_true: Tensor,
    /// Box width/height per object slot
    pub wh_true: Tensor,
    /// Sub-cell center offset per object slot
    pub reg_true: Tensor,
    /// 1.0 for a real object, 0.0 for padding
    pub reg_mask: Tensor,
    /// Flattened heatmap cell `y * width + x` per object slot
    pub indices: Tensor,
}

impl TrainingTargets {
    /// Batch size
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.hm_true.dims4()?.0)
    }

    /// Maximum number of object slots
    pub fn max_objects(&self) -> Result<usize> {
        Ok(self.indices.dims2()?.1)
    }

    /// Number of real (unmasked) objects across the batch
    pub fn num_objects(&self) -> Result<usize> {
        let n = self
            .reg_mask
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        Ok(n.round() as usize)
    }

    /// Check that all shapes agree with each other
    pub fn check_shapes(&self) -> Result<()> {
        let (b, _h, _w, _c) = self.hm_true.dims4()?;
        let (mb, k) = self.reg_mask.dims2()?;
        let (ib, ik) = self.indices.dims2()?;
        ensure!(
            mb == b && ib == b,
            "batch size mismatch: hm_true {}, reg_mask {}, indices {}",
            b,
            mb,
            ib
        );
        ensure!(ik == k, "indices has {} slots, reg_mask has {}", ik, k);
        for (name, t) in [("wh_true", &self.wh_true), ("reg_true", &self.reg_true)] {
            let (tb, tk, _) = t.dims3()?;
            ensure!(
                tb == b && tk == k,
                "{} shape {:?} does not match (batch={}, max_objects={})",
                name,
                t.dims(),
                b,
                k
            );
        }
        Ok(())
    }
}

/// Raw outputs of the three detection heads
#[derive(Debug, Clone)]
pub struct HeadOutputs {
    /// Center heatmap after sigmoid
    pub hm_pred: Tensor,
    /// Dense box size map
    pub wh_pred: Tensor,
    /// Dense center offset map
    pub reg_pred: Tensor,
}

impl HeadOutputs {
    /// Check that the heads agree with each other and with `targets`
    pub fn check_shapes(&self, targets: &TrainingTargets) -> Result<()> {
        ensure!(
            self.hm_pred.dims() == targets.hm_true.dims(),
            "hm_pred shape {:?} does not match hm_true {:?}",
            self.hm_pred.dims(),
            targets.hm_true.dims()
        );
        let (b, h, w, _) = self.hm_pred.dims4()?;
        for (name, t) in [("wh_pred", &self.wh_pred), ("reg_pred", &self.reg_pred)] {
            let (tb, th, tw, _) = t.dims4()?;
            ensure!(
                (tb, th, tw) == (b, h, w),
                "{} shape {:?} does not match heatmap grid ({}, {}, {})",
                name,
                t.dims(),
                b,
                h,
                w
            );
        }
        Ok(())
    }
}
