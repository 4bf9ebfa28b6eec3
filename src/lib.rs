//! # centernet-loss
//!
//! Training losses for CenterNet-style keypoint detection, on Candle.
//!
//! ## Features
//!
//! - Penalty-reduced focal loss for the center heatmap head
//! - Masked L1 loss for the box size and center offset heads
//! - Weighted total loss, configurable from YAML
//! - Debug driver that dumps batch tensors to `.npy` and prints the losses
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use centernet_loss::{CenterNetLoss, HeadOutputs, TrainingTargets};
//!
//! let loss = CenterNetLoss::new();
//! let out = loss.forward(&preds, &targets)?;
//! println!("{}", out.summary()?);
//! ```

// Require docs for public items
#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod batch;
pub mod config;
pub mod debug;
pub mod losses;
pub mod utils;

// Re-exports for convenience
pub use batch::{HeadOutputs, TrainingTargets};
pub use config::LossConfig;
pub use losses::{focal_loss, reg_l1_loss, CenterNetLoss, HeadLosses, LossOutput, LossSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
