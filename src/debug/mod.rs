//! Debug and validation utilities
//!
//! Tools for inspecting the losses outside a training run:
//! - NPY file reading and writing
//! - Dumping targets, head outputs and losses batch by batch
//! - Synthetic batches and a noisy stand-in predictor
//! - Comparing losses against reference values with tolerance

mod dump;
mod npy;
mod synthetic;
mod validator;

pub use dump::{
    is_batch_dir, load_predictions, load_targets, save_predictions, save_targets, BatchReport,
    BatchSource, NpyBatchDir, Predictor, TensorDumper, PREDICTION_NAMES, TARGET_NAMES,
};
pub use npy::{load_npy, load_npy_f32, load_npy_tensor, save_npy_tensor, NpyArray};
pub use synthetic::{gaussian_radius, NoisyPredictor, SyntheticBatches, SyntheticConfig};
pub use validator::{
    load_reference, parse_reference, ValidationConfig, ValidationResult, Validator,
};
