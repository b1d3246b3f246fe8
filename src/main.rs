use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vidtrn::training::{
    DataLoaderConfig, HistoryReport, JsonHistoryReport, ResumeOutcome, RunOutcome, SyntheticClips,
    SyntheticClipsConfig,
};
use vidtrn::{DataLoader, SegmentConsensusNet, SegmentConsensusNetConfig, Trainer, TrainingConfig};

#[derive(Parser)]
#[command(name = "vidtrn")]
#[command(about = "Training loop for Temporal Relation Network video classifiers", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train (or evaluate) the reference model on synthetic clips
    Train {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, env = "VIDTRN_CONFIG", default_value = "config.yaml")]
        config: PathBuf,

        /// Checkpoint to resume from
        #[arg(short, long)]
        resume: Option<PathBuf>,

        /// Only run one evaluation pass
        #[arg(short, long)]
        evaluate: bool,

        /// Override the number of epochs
        #[arg(long)]
        epochs: Option<usize>,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Train {
            config,
            resume,
            evaluate,
            epochs,
        } => {
            train(config, resume, evaluate, epochs)?;
        }

        Commands::Config { file } => {
            validate_config(file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

fn train(config_path: PathBuf, resume: Option<PathBuf>, evaluate: bool, epochs: Option<usize>) -> Result<()> {
    let mut config = TrainingConfig::from_file(&config_path).context("Failed to load configuration file")?;
    if resume.is_some() {
        config.training.resume = resume;
    }
    if evaluate {
        config.training.evaluate = true;
    }
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }
    config.validate().context("Invalid configuration")?;

    let run_name = config.run_name();
    info!("storing name: {}", run_name);

    let device = config.runtime.device().context("Failed to initialise device")?;
    let profile = config.arch_profile();

    let model = SegmentConsensusNet::new(
        SegmentConsensusNetConfig {
            num_segments: config.model.num_segments,
            feature_dim: config.data.feature_dim,
            hidden_dim: config.model.img_feature_dim,
            num_class: config.model.num_class,
            seed: config.training.seed,
        },
        &device,
    )
    .context("Failed to build model")?;

    let mut trainer = Trainer::new(config.clone(), model, device.clone()).context("Failed to initialise trainer")?;
    trainer.load_pretrained().context("Failed to load pretrained weights")?;
    if let Some(ResumeOutcome::Resumed { epoch, best_prec1 }) =
        trainer.resume_from_config().context("Failed to resume")?
    {
        info!("resuming at epoch {} with best Prec@1 {:.3}", epoch, best_prec1);
    }

    let clips = |num_clips: usize, seed: u64| SyntheticClipsConfig {
        num_clips,
        num_segments: config.model.num_segments,
        feature_dim: config.data.feature_dim,
        num_class: config.model.num_class,
        noise: config.data.noise,
        seed,
    };
    let train_data = SyntheticClips::generate(&clips(config.data.train_clips, config.training.seed), &profile, &device)?;
    let val_data = SyntheticClips::generate(&clips(config.data.val_clips, config.training.seed + 1), &profile, &device)?;

    let mut train_loader = DataLoader::new(
        train_data,
        DataLoaderConfig {
            batch_size: config.training.batch_size,
            shuffle: config.data.shuffle,
            drop_last: false,
            seed: config.training.seed,
        },
        device.clone(),
    )?;
    let mut val_loader = DataLoader::new(
        val_data,
        DataLoaderConfig {
            batch_size: config.training.batch_size,
            shuffle: false,
            drop_last: false,
            seed: config.training.seed,
        },
        device,
    )?;

    match trainer.run(&mut train_loader, &mut val_loader).context("Training failed")? {
        RunOutcome::Evaluated(metrics) => {
            info!("Evaluation: Prec@1 {:.3} Loss {:.5}", metrics.top1, metrics.loss);
        }
        RunOutcome::Trained(history) => {
            let mut report = JsonHistoryReport::new(&config.paths.root_output, &run_name);
            report.publish(&history).context("Failed to write history report")?;
            info!("Best Prec@1: {:.3}", trainer.state().best_prec1);
        }
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = TrainingConfig::from_file(&config_path).context("Failed to load configuration file")?;
    config.validate().context("Invalid configuration")?;

    info!("Configuration is valid");
    info!("Configuration summary:");
    info!("  - Run name: {}", config.run_name());
    info!(
        "  - Model: {} / {} ({} segments, {} classes)",
        config.model.arch, config.model.consensus_type, config.model.num_segments, config.model.num_class
    );
    info!(
        "  - Optimizer: lr {} steps {:?} momentum {} weight decay {}",
        config.optimizer.learning_rate, config.optimizer.lr_steps, config.optimizer.momentum, config.optimizer.weight_decay
    );
    info!("  - Epochs: {}, batch size {}", config.training.epochs, config.training.batch_size);

    Ok(())
}

fn show_system_info() {
    println!("VidTRN - Temporal Relation Network training loop");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  [x] NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  [ ] CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  [x] Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  [ ] Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  [x] Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  [ ] Accelerate support (not compiled)");

    println!("  [x] CPU training");
    println!();
    println!("Usage:");
    println!("  vidtrn train -c config.yaml            # Train");
    println!("  vidtrn train -c config.yaml -e         # Evaluate only");
    println!("  vidtrn train -c config.yaml -r model/TRN_..._checkpoint.safetensors");
    println!("  vidtrn config -f config.yaml           # Validate configuration");
    println!("  vidtrn info                            # Show this information");
}
