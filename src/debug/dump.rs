//! Tensor dump driver
//!
//! Runs a predictor over every batch of a source, writes the targets and
//! head outputs as `.npy` files and reports the unweighted head losses.
//! The file names match the ones the Python training tooling writes, so
//! a Rust dump and a Python dump of the same batch can be compared file
//! by file.

use anyhow::{Context, Result};
use candle_core::Device;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::npy::{load_npy_tensor, save_npy_tensor};
use crate::batch::{HeadOutputs, TrainingTargets};
use crate::losses::{CenterNetLoss, HeadLosses};

/// Target file stems, in dump order
pub const TARGET_NAMES: [&str; 5] = ["hm_true", "wh_true", "reg_true", "reg_mask", "indices"];

/// Prediction file stems, in dump order
pub const PREDICTION_NAMES: [&str; 3] = ["hm_pred", "wh_pred", "reg_pred"];

/// Something that yields training batches
pub trait BatchSource {
    /// Next batch, `None` when exhausted
    fn next_batch(&mut self) -> Result<Option<TrainingTargets>>;

    /// Number of batches left, if known
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Something that produces head outputs for a batch
///
/// A real detector would run on the batch images; the debug predictors
/// only need the targets.
pub trait Predictor {
    /// Head outputs for `targets`
    fn predict(&mut self, targets: &TrainingTargets) -> Result<HeadOutputs>;
}

fn npy_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.npy", name))
}

/// Write the five target arrays into `dir`
pub fn save_targets(dir: &Path, targets: &TrainingTargets) -> Result<()> {
    let tensors = [
        &targets.hm_true,
        &targets.wh_true,
        &targets.reg_true,
        &targets.reg_mask,
        &targets.indices,
    ];
    for (name, t) in TARGET_NAMES.iter().zip(tensors) {
        save_npy_tensor(npy_path(dir, name), t)?;
    }
    Ok(())
}

/// Write the three prediction arrays into `dir`
pub fn save_predictions(dir: &Path, preds: &HeadOutputs) -> Result<()> {
    let tensors = [&preds.hm_pred, &preds.wh_pred, &preds.reg_pred];
    for (name, t) in PREDICTION_NAMES.iter().zip(tensors) {
        save_npy_tensor(npy_path(dir, name), t)?;
    }
    Ok(())
}

/// Read the five target arrays from `dir`
pub fn load_targets(dir: &Path, device: &Device) -> Result<TrainingTargets> {
    let load = |name: &str| {
        let path = npy_path(dir, name);
        load_npy_tensor(&path, device).with_context(|| format!("Failed to load {:?}", path))
    };
    let targets = TrainingTargets {
        hm_true: load("hm_true")?,
        wh_true: load("wh_true")?,
        reg_true: load("reg_true")?,
        reg_mask: load("reg_mask")?,
        indices: load("indices")?,
    };
    targets.check_shapes()?;
    Ok(targets)
}

/// Read the three prediction arrays from `dir`
pub fn load_predictions(dir: &Path, device: &Device) -> Result<HeadOutputs> {
    let load = |name: &str| {
        let path = npy_path(dir, name);
        load_npy_tensor(&path, device).with_context(|| format!("Failed to load {:?}", path))
    };
    Ok(HeadOutputs {
        hm_pred: load("hm_pred")?,
        wh_pred: load("wh_pred")?,
        reg_pred: load("reg_pred")?,
    })
}

/// Whether `dir` holds a complete dumped batch
pub fn is_batch_dir(dir: &Path) -> bool {
    TARGET_NAMES
        .iter()
        .chain(PREDICTION_NAMES.iter())
        .all(|name| npy_path(dir, name).is_file())
}

/// Batches previously dumped to disk
///
/// Either a single batch directory, or a directory of batch
/// subdirectories visited in name order.
pub struct NpyBatchDir {
    dirs: Vec<PathBuf>,
    next: usize,
    device: Device,
}

impl NpyBatchDir {
    /// Scan `root` for dumped batches
    pub fn open<P: AsRef<Path>>(root: P, device: &Device) -> Result<Self> {
        let root = root.as_ref();
        let dirs = if is_batch_dir(root) {
            vec![root.to_path_buf()]
        } else {
            let mut dirs: Vec<PathBuf> = fs::read_dir(root)
                .with_context(|| format!("Failed to read dump directory {:?}", root))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_dir() && is_batch_dir(p))
                .collect();
            dirs.sort();
            dirs
        };
        anyhow::ensure!(!dirs.is_empty(), "No dumped batches found in {:?}", root);
        debug!("found {} dumped batches in {:?}", dirs.len(), root);

        Ok(Self {
            dirs,
            next: 0,
            device: device.clone(),
        })
    }

    /// Batch directories in visiting order
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// The only batch directory, or an error if several were found
    ///
    /// Reference losses describe one batch, so comparing them against a
    /// whole dump would be meaningless.
    pub fn single(&self) -> Result<&Path> {
        match self.dirs.as_slice() {
            [dir] => Ok(dir),
            dirs => anyhow::bail!(
                "Expected a single batch directory, found {} batches",
                dirs.len()
            ),
        }
    }

    /// Load targets and stored predictions of the next batch
    pub fn next_with_predictions(&mut self) -> Result<Option<(TrainingTargets, HeadOutputs)>> {
        let Some(dir) = self.dirs.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let targets = load_targets(dir, &self.device)?;
        let preds = load_predictions(dir, &self.device)?;
        Ok(Some((targets, preds)))
    }
}

impl BatchSource for NpyBatchDir {
    fn next_batch(&mut self) -> Result<Option<TrainingTargets>> {
        let Some(dir) = self.dirs.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        load_targets(dir, &self.device).map(Some)
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.dirs.len() - self.next)
    }
}

/// Losses and location of one dumped batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Zero-based batch number
    pub index: usize,
    /// Directory the arrays were written to
    pub dir: PathBuf,
    /// Unweighted head losses
    pub losses: HeadLosses,
}

/// Writes every batch of a source to disk together with its losses
pub struct TensorDumper {
    out_dir: PathBuf,
    loss: CenterNetLoss,
}

impl TensorDumper {
    /// Dump into `out_dir`, one `batch_NNNN` subdirectory per batch
    pub fn new<P: AsRef<Path>>(out_dir: P, loss: CenterNetLoss) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
            loss,
        }
    }

    /// Directory of batch `index`
    pub fn batch_dir(&self, index: usize) -> PathBuf {
        self.out_dir.join(format!("batch_{:04}", index))
    }

    /// Dump a single batch
    pub fn dump_batch(
        &self,
        index: usize,
        targets: &TrainingTargets,
        preds: &HeadOutputs,
    ) -> Result<BatchReport> {
        let dir = self.batch_dir(index);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;

        save_targets(&dir, targets)?;
        save_predictions(&dir, preds)?;
        let losses = self.loss.head_losses(preds, targets)?;
        debug!(index, ?dir, "dumped batch");

        Ok(BatchReport { index, dir, losses })
    }

    /// Drain `source`, calling `on_batch` after each batch is written
    pub fn run<S, P, F>(&self, source: &mut S, predictor: &mut P, mut on_batch: F) -> Result<Vec<BatchReport>>
    where
        S: BatchSource + ?Sized,
        P: Predictor + ?Sized,
        F: FnMut(&BatchReport),
    {
        let mut reports = Vec::new();
        while let Some(targets) = source.next_batch()? {
            let preds = predictor.predict(&targets)?;
            let report = self.dump_batch(reports.len(), &targets, &preds)?;
            on_batch(&report);
            reports.push(report);
        }
        info!("dumped {} batches to {:?}", reports.len(), self.out_dir);
        Ok(reports)
    }
}
