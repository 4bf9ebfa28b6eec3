//! Loss configuration
//!
//! Loaded from YAML. Every field is optional and falls back to the
//! CenterNet defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Heatmap focal loss parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocalLossConfig {
    /// Exponent on the prediction error term
    pub alpha: f64,
    /// Exponent on `(1 - target)` for the negative weights
    pub beta: f64,
    /// Predictions are clipped to `[clip_eps, 1 - clip_eps]` before the log
    pub clip_eps: f64,
}

impl Default for FocalLossConfig {
    fn default() -> Self {
        Self {
            alpha: 2.0,
            beta: 4.0,
            clip_eps: 1e-4,
        }
    }
}

/// L1 regression loss parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegL1Config {
    /// Added to the mask sum before dividing
    pub norm_eps: f64,
}

impl Default for RegL1Config {
    fn default() -> Self {
        Self { norm_eps: 1e-4 }
    }
}

/// Per-head weights of the total loss
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    /// Heatmap focal loss
    pub hm: f64,
    /// Box size L1 loss
    pub wh: f64,
    /// Center offset L1 loss
    pub reg: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            hm: 1.0,
            wh: 0.1,
            reg: 1.0,
        }
    }
}

/// Complete loss configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Focal loss parameters
    pub focal: FocalLossConfig,
    /// L1 loss parameters
    pub reg_l1: RegL1Config,
    /// Head weights
    pub weights: LossWeights,
}

impl LossConfig {
    /// Load from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        Ok(config)
    }

    /// Parse from a YAML string and validate
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Reject values that would make the losses meaningless
    pub fn validate(&self) -> Result<()> {
        let f = &self.focal;
        anyhow::ensure!(f.alpha >= 0.0, "focal.alpha must be non-negative, got {}", f.alpha);
        anyhow::ensure!(f.beta >= 0.0, "focal.beta must be non-negative, got {}", f.beta);
        anyhow::ensure!(
            f.clip_eps > 0.0 && f.clip_eps < 0.5,
            "focal.clip_eps must be in (0, 0.5), got {}",
            f.clip_eps
        );
        anyhow::ensure!(
            self.reg_l1.norm_eps > 0.0,
            "reg_l1.norm_eps must be positive, got {}",
            self.reg_l1.norm_eps
        );
        let w = &self.weights;
        anyhow::ensure!(
            w.hm >= 0.0 && w.wh >= 0.0 && w.reg >= 0.0,
            "loss weights must be non-negative, got hm={} wh={} reg={}",
            w.hm,
            w.wh,
            w.reg
        );
        Ok(())
    }
}
