//! Integration tests for centernet-loss
//!
//! Tests the losses end to end: synthetic batches, .npy dump and replay,
//! configuration and validation.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use centernet_loss::debug::{
    load_npy, load_reference, load_targets, parse_reference, save_npy_tensor, BatchSource,
    NoisyPredictor, NpyBatchDir, Predictor, SyntheticBatches, SyntheticConfig, TensorDumper,
    Validator, PREDICTION_NAMES, TARGET_NAMES,
};
use centernet_loss::{
    focal_loss, reg_l1_loss, CenterNetLoss, HeadOutputs, LossConfig, TrainingTargets,
};

fn synthetic(seed: u64) -> (TrainingTargets, HeadOutputs) {
    let device = Device::Cpu;
    let config = SyntheticConfig {
        batch_size: 2,
        height: 24,
        width: 24,
        num_classes: 3,
        max_objects: 6,
        ..SyntheticConfig::default()
    };
    let targets = SyntheticBatches::new(config, 1, seed, &device)
        .unwrap()
        .generate()
        .unwrap();
    let preds = NoisyPredictor::new(seed).predict(&targets).unwrap();
    (targets, preds)
}

/// Weighted total equals hm + 0.1 * wh + reg of the free functions
#[test]
fn test_total_matches_free_functions() -> Result<()> {
    let (targets, preds) = synthetic(5);

    let hm = focal_loss(&preds.hm_pred, &targets.hm_true)?.to_scalar::<f32>()?;
    let wh = reg_l1_loss(&preds.wh_pred, &targets.wh_true, &targets.indices, &targets.reg_mask)?
        .to_scalar::<f32>()?;
    let reg = reg_l1_loss(&preds.reg_pred, &targets.reg_true, &targets.indices, &targets.reg_mask)?
        .to_scalar::<f32>()?;

    let summary = CenterNetLoss::new().forward(&preds, &targets)?.summary()?;
    assert!((summary.hm - hm).abs() < 1e-6);
    assert!((summary.wh - 0.1 * wh).abs() < 1e-6);
    assert!((summary.reg - reg).abs() < 1e-6);
    assert!((summary.total - (hm + 0.1 * wh + reg)).abs() < 1e-4);
    Ok(())
}

/// Matching the targets beats an uninformative prediction
#[test]
fn test_focal_loss_prefers_targets() -> Result<()> {
    let (targets, _) = synthetic(9);
    let flat = Tensor::full(0.5f32, targets.hm_true.dims(), &Device::Cpu)?;

    let uninformative = focal_loss(&flat, &targets.hm_true)?.to_scalar::<f32>()?;
    let exact = focal_loss(&targets.hm_true, &targets.hm_true)?.to_scalar::<f32>()?;
    assert!(exact < uninformative, "exact={} flat={}", exact, uninformative);
    Ok(())
}

/// Heatmaps with no object fall back to the unnormalized negative loss
#[test]
fn test_empty_heatmap() -> Result<()> {
    let device = Device::Cpu;
    let hm_true = Tensor::zeros((1, 8, 8, 2), DType::F32, &device)?;
    let hm_pred = Tensor::full(0.1f32, (1, 8, 8, 2), &device)?;

    let loss = focal_loss(&hm_pred, &hm_true)?.to_scalar::<f32>()?;
    let per_cell = -(0.9f32).ln() * 0.01;
    assert!((loss - 128.0 * per_cell).abs() < 1e-4);
    Ok(())
}

/// Dump synthetic batches, replay them from disk, and get the same losses
#[test]
fn test_dump_and_replay() -> Result<()> {
    let device = Device::Cpu;
    let out = tempfile::tempdir()?;

    let mut source = SyntheticBatches::new(SyntheticConfig::default(), 2, 1, &device)?;
    let mut predictor = NoisyPredictor::new(2);
    let dumper = TensorDumper::new(out.path(), CenterNetLoss::new());
    let reports = dumper.run(&mut source, &mut predictor, |_| {})?;
    assert_eq!(reports.len(), 2);

    for name in TARGET_NAMES.iter().chain(PREDICTION_NAMES.iter()) {
        let arr = load_npy(reports[0].dir.join(format!("{}.npy", name)))?;
        assert!(!arr.is_empty(), "{} is empty", name);
    }

    let loss = CenterNetLoss::new();
    let mut replay = NpyBatchDir::open(out.path(), &device)?;
    let mut validator = Validator::new();
    for report in &reports {
        let (targets, preds) = replay.next_with_predictions()?.expect("dumped batch");
        let losses = loss.head_losses(&preds, &targets)?;
        validator.check_losses(&report.losses, &losses);
    }
    assert!(replay.next_with_predictions()?.is_none());
    assert!(validator.all_passed());
    Ok(())
}

/// Targets written from float32 indices, as the Python generator does
#[test]
fn test_float_indices_from_disk() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let (targets, _) = synthetic(3);

    let indices = targets.indices.to_dtype(DType::F32)?;
    save_npy_tensor(dir.path().join("hm_true.npy"), &targets.hm_true)?;
    save_npy_tensor(dir.path().join("wh_true.npy"), &targets.wh_true)?;
    save_npy_tensor(dir.path().join("reg_true.npy"), &targets.reg_true)?;
    save_npy_tensor(dir.path().join("reg_mask.npy"), &targets.reg_mask)?;
    save_npy_tensor(dir.path().join("indices.npy"), &indices)?;

    let loaded = load_targets(dir.path(), &device)?;
    assert_eq!(loaded.indices.dtype(), DType::F32);

    let preds = NoisyPredictor::new(3).predict(&targets)?;
    let loss = CenterNetLoss::new();
    let a = loss.head_losses(&preds, &targets)?;
    let b = loss.head_losses(&preds, &loaded)?;
    assert_eq!(a, b);
    Ok(())
}

/// YAML config changes the head weights
#[test]
fn test_config_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("loss.yaml");
    std::fs::write(&path, "weights:\n  hm: 2.0\n  wh: 0.0\n")?;

    let config = LossConfig::load(&path)?;
    let (targets, preds) = synthetic(4);

    let default = CenterNetLoss::new().forward(&preds, &targets)?.summary()?;
    let custom = CenterNetLoss::with_config(&config).forward(&preds, &targets)?.summary()?;
    assert!((custom.hm - 2.0 * default.hm).abs() < 1e-5);
    assert_eq!(custom.wh, 0.0);
    assert!((custom.reg - default.reg).abs() < 1e-6);
    Ok(())
}

/// Reference losses from a string or an .npy file
#[test]
fn test_reference_sources() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("losses.npy");
    let values = Tensor::new(&[1.5f32, 0.25, 0.125], &Device::Cpu)?;
    save_npy_tensor(&path, &values)?;

    let from_file = load_reference(&path)?;
    let from_str = parse_reference("1.5,0.25,0.125")?;
    assert_eq!(from_file, from_str);
    Ok(())
}

/// Exhausted sources stop the driver
#[test]
fn test_source_exhaustion() -> Result<()> {
    let device = Device::Cpu;
    let mut source = SyntheticBatches::new(SyntheticConfig::default(), 0, 0, &device)?;
    assert_eq!(source.len_hint(), Some(0));
    assert!(source.next_batch()?.is_none());
    Ok(())
}
