//! centernet-loss CLI - evaluate and dump CenterNet training losses

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use centernet_loss::debug::{
    load_reference, parse_reference, NoisyPredictor, NpyBatchDir, SyntheticBatches,
    SyntheticConfig, TensorDumper, Validator,
};
use centernet_loss::{CenterNetLoss, HeadLosses, LossConfig, VERSION};

/// centernet-loss - CenterNet heatmap/size/offset losses on Candle
#[derive(Parser, Debug)]
#[command(name = "centernet-loss")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    /// Path to loss config file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute losses of batches dumped as .npy files
    Eval {
        /// Batch directory, or a directory of batch_* subdirectories
        #[arg(short, long)]
        dir: PathBuf,

        /// Reference losses of a single batch: "focal,wh,reg" or a losses
        /// .npy file. `dir` must then hold exactly one batch.
        #[arg(short, long)]
        expected: Option<String>,
    },

    /// Generate synthetic batches, dump their tensors and print the losses
    Dump {
        /// Output directory
        #[arg(short, long, default_value = "debug")]
        out: PathBuf,

        /// Number of batches
        #[arg(short, long, default_value = "1")]
        batches: usize,

        /// RNG seed for targets and predictions
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Images per batch
        #[arg(long, default_value = "1")]
        batch_size: usize,

        /// Heatmap height
        #[arg(long, default_value = "128")]
        height: usize,

        /// Heatmap width
        #[arg(long, default_value = "128")]
        width: usize,

        /// Number of classes
        #[arg(long, default_value = "20")]
        classes: usize,

        /// Object slots per image
        #[arg(long, default_value = "100")]
        max_objects: usize,
    },

    /// Show the effective loss configuration
    Info,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn create_progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(ProgressStyle::default_bar().template("{bar:40.green} {pos}/{len} {msg}")?);
    Ok(pb)
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    info!("Using device: {:?}", device);
    Ok(device)
}

fn print_losses(losses: &HeadLosses) {
    println!("{}", losses);
    println!();
}

fn reference_losses(expected: &str) -> Result<HeadLosses> {
    if Path::new(expected).is_file() {
        load_reference(expected)
    } else {
        parse_reference(expected)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    info!("centernet-loss v{}", VERSION);

    let loss_config = LossConfig::load_or_default(cli.config.as_ref())?;

    match cli.command {
        Commands::Eval { dir, expected } => {
            let device = select_device(cli.cpu)?;
            let loss = CenterNetLoss::with_config(&loss_config);
            let reference = expected.as_deref().map(reference_losses).transpose()?;
            let mut validator = Validator::new();

            let mut batches = NpyBatchDir::open(&dir, &device)?;
            info!("Evaluating {} batch(es) from {:?}", batches.dirs().len(), dir);
            if reference.is_some() {
                batches.single()?;
            }

            while let Some((targets, preds)) = batches.next_with_predictions()? {
                let losses = loss.head_losses(&preds, &targets)?;
                print_losses(&losses);
                info!("{}", loss.forward(&preds, &targets)?.summary()?);

                if let Some(reference) = &reference {
                    validator.check_losses(reference, &losses);
                }
            }

            if reference.is_some() {
                validator.print_summary();
                anyhow::ensure!(validator.all_passed(), "Losses differ from the reference");
            }
            Ok(())
        }

        Commands::Dump {
            out,
            batches,
            seed,
            batch_size,
            height,
            width,
            classes,
            max_objects,
        } => {
            let device = select_device(cli.cpu)?;
            let synthetic = SyntheticConfig {
                batch_size,
                height,
                width,
                num_classes: classes,
                max_objects,
                ..SyntheticConfig::default()
            };
            let mut source = SyntheticBatches::new(synthetic, batches, seed, &device)?;
            let mut predictor = NoisyPredictor::new(seed.wrapping_add(1));
            let dumper = TensorDumper::new(&out, CenterNetLoss::with_config(&loss_config));

            let pb = create_progress_bar(batches)?;
            let reports = dumper.run(&mut source, &mut predictor, |report| {
                pb.suspend(|| print_losses(&report.losses));
                pb.inc(1);
            })?;
            pb.finish_with_message(format!("{} batch(es) written to {:?}", reports.len(), out));
            Ok(())
        }

        Commands::Info => {
            match &cli.config {
                Some(path) => info!("Loaded config from {:?}", path),
                None => info!("No config given, using defaults"),
            }
            println!("{:#?}", loss_config);
            Ok(())
        }
    }
}
