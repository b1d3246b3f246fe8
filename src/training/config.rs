//! Training configuration for TRN video models
//!
//! Configuration is loaded once at startup from JSON or YAML, validated
//! fail-fast, and then passed by reference to everything that needs it.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::ArchProfile;
use crate::training::loss::LossType;

/// Main training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Model configuration
    pub model: ModelConfig,

    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Training loop parameters
    pub training: TrainingParams,

    /// Synthetic data used by the command line runner
    pub data: DataConfig,

    /// Loss function name
    pub loss_type: String,

    /// Output locations
    pub paths: PathsConfig,

    /// Runtime configuration
    pub runtime: RuntimeConfig,
}

/// Model-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Backbone architecture name
    pub arch: String,

    /// Temporal consensus module name
    pub consensus_type: String,

    /// Segments sampled per clip
    pub num_segments: usize,

    /// Output classes
    pub num_class: usize,

    /// Width of the per-segment feature fed to the consensus module
    pub img_feature_dim: usize,

    /// Freeze running statistics of all normalisation layers but the first
    pub partial_bn: bool,

    /// Optional pretrained initialisation
    pub pretrained: Option<PretrainedConfig>,
}

/// Pretrained weights to transplant before training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainedConfig {
    /// Safetensors artifact
    pub path: PathBuf,

    /// Segment count the artifact was trained with, when not recorded in it
    #[serde(default)]
    pub num_segments: Option<usize>,

    /// Drop the first dotted component of every stored name
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
}

/// Optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Base learning rate
    pub learning_rate: f64,

    /// Epochs at which the learning rate is divided by 10
    pub lr_steps: Vec<usize>,

    /// SGD momentum
    pub momentum: f64,

    /// Base weight decay
    pub weight_decay: f64,

    /// Global gradient norm bound; `None` disables clipping
    pub clip_gradient: Option<f64>,
}

/// Training loop parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Total number of epochs
    pub epochs: usize,

    /// First epoch to run when not resuming
    pub start_epoch: usize,

    /// Batch size
    pub batch_size: usize,

    /// Progress line cadence in batches
    pub print_freq: usize,

    /// Only run one evaluation pass
    pub evaluate: bool,

    /// Checkpoint to resume from
    pub resume: Option<PathBuf>,

    /// Seed for model initialisation and shuffling
    pub seed: u64,
}

/// Synthetic clip source for smoke runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Clips in the training split
    pub train_clips: usize,

    /// Clips in the validation split
    pub val_clips: usize,

    /// Features per segment
    pub feature_dim: usize,

    /// Noise around each class prototype, in pixel units
    pub noise: f32,

    /// Shuffle the training split every epoch
    pub shuffle: bool,
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Progress logs
    pub root_log: PathBuf,

    /// Checkpoints
    pub root_model: PathBuf,

    /// Reports
    pub root_output: PathBuf,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Compute device
    pub device: DeviceType,
}

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda,
}

fn default_true() -> bool {
    true
}

impl TrainingConfig {
    /// Create a new training configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from file; `.json` files are JSON, anything else YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;

        let config = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };

        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Model
        if self.model.num_segments == 0 {
            return Err(Error::config("Number of segments must be greater than 0"));
        }
        if self.model.num_class == 0 {
            return Err(Error::config("Number of classes must be greater than 0"));
        }
        if self.model.img_feature_dim == 0 {
            return Err(Error::config("Image feature dimension must be greater than 0"));
        }
        if let Some(pretrained) = &self.model.pretrained {
            if let Some(n) = pretrained.num_segments {
                if n != self.model.num_segments {
                    return Err(Error::incompatible_checkpoint(format!(
                        "pretrained model uses {} segments, configured for {}",
                        n, self.model.num_segments
                    )));
                }
            }
        }

        // Optimizer
        if self.optimizer.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }
        if self.optimizer.momentum < 0.0 {
            return Err(Error::config("Momentum must be non-negative"));
        }
        if self.optimizer.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }
        if matches!(self.optimizer.clip_gradient, Some(c) if c <= 0.0) {
            return Err(Error::config("Gradient clipping threshold must be positive"));
        }
        if self.optimizer.lr_steps.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::config(format!(
                "Learning rate steps must be ascending, got {:?}",
                self.optimizer.lr_steps
            )));
        }

        // Training
        if self.training.epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }
        if self.training.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if self.training.print_freq == 0 {
            return Err(Error::config("Print frequency must be greater than 0"));
        }
        if self.training.start_epoch > self.training.epochs {
            return Err(Error::config(format!(
                "Start epoch {} is past the last epoch {}",
                self.training.start_epoch, self.training.epochs
            )));
        }

        // Data
        if self.data.feature_dim == 0 {
            return Err(Error::config("Feature dimension must be greater than 0"));
        }
        if self.data.noise < 0.0 {
            return Err(Error::config("Noise must be non-negative"));
        }

        self.loss_type()?;
        Ok(())
    }

    /// Parsed loss type
    pub fn loss_type(&self) -> Result<LossType> {
        self.loss_type.parse()
    }

    /// Identifier shared by logs, checkpoints and reports of this run
    pub fn run_name(&self) -> String {
        format!(
            "TRN_{}_{}_segment{}",
            self.model.arch, self.model.consensus_type, self.model.num_segments
        )
    }

    /// Input-pipeline capabilities of the configured backbone
    pub fn arch_profile(&self) -> ArchProfile {
        ArchProfile::for_arch(&self.model.arch)
    }

    /// Progress log file of this run
    pub fn log_path(&self) -> PathBuf {
        self.paths.root_log.join(format!("{}.csv", self.run_name()))
    }

    /// Create the log, model and output folders if missing
    pub fn ensure_root_folders(&self) -> Result<()> {
        for folder in [&self.paths.root_log, &self.paths.root_model, &self.paths.root_output] {
            if !folder.exists() {
                info!("creating folder {}", folder.display());
                fs::create_dir_all(folder)?;
            }
        }
        Ok(())
    }
}

impl RuntimeConfig {
    /// Resolve the compute device; CUDA falls back to CPU when unavailable
    pub fn device(&self) -> Result<Device> {
        match self.device {
            DeviceType::Cpu => Ok(Device::Cpu),
            DeviceType::Cuda => {
                let device = Device::cuda_if_available(0)?;
                if device.is_cpu() {
                    warn!("CUDA requested but not available, using CPU");
                }
                Ok(device)
            }
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            training: TrainingParams::default(),
            data: DataConfig::default(),
            loss_type: "nll".to_string(),
            paths: PathsConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: "BNInception".to_string(),
            consensus_type: "TRNmultiscale".to_string(),
            num_segments: 8,
            num_class: 174,
            img_feature_dim: 256,
            partial_bn: true,
            pretrained: None,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            lr_steps: vec![50, 100],
            momentum: 0.9,
            weight_decay: 5e-4,
            clip_gradient: Some(20.0),
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 120,
            start_epoch: 0,
            batch_size: 64,
            print_freq: 20,
            evaluate: false,
            resume: None,
            seed: 42,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_clips: 1024,
            val_clips: 256,
            feature_dim: 48,
            noise: 40.0,
            shuffle: true,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root_log: PathBuf::from("log"),
            root_model: PathBuf::from("model"),
            root_output: PathBuf::from("output"),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { device: DeviceType::Cpu }
    }
}
