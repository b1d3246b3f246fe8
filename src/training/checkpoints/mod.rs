//! Checkpoint persistence
//!
//! Every run owns two safetensors artifacts in the model directory:
//!
//! * `<run>_checkpoint.safetensors`: rewritten after every epoch
//! * `<run>_best.safetensors`: a copy of the latest artifact, refreshed only
//!   when the epoch improved the best validation precision
//!
//! Scalar training state (next epoch, best precision, architecture) lives in
//! the safetensors header metadata. Optimizer momentum buffers are stored as
//! extra tensors under [`MOMENTUM_PREFIX`].

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Tensor name prefix of persisted momentum buffers
pub const MOMENTUM_PREFIX: &str = "optimizer.momentum.";

const META_EPOCH: &str = "epoch";
const META_ARCH: &str = "arch";
const META_BEST_PREC1: &str = "best_prec1";
const META_NUM_SEGMENTS: &str = "num_segments";
const META_CONSENSUS: &str = "consensus_type";
const META_SAVED_AT: &str = "saved_at";

/// Full resumable training state
#[derive(Debug, Clone)]
pub struct TrainingCheckpoint {
    /// Index of the next epoch to run
    pub epoch: usize,
    pub arch: String,
    pub consensus_type: String,
    pub num_segments: usize,
    /// Best validation top-1 precision so far
    pub best_prec1: f64,
    /// Model parameters and buffers by name
    pub state_dict: HashMap<String, Tensor>,
    /// Optimizer momentum buffers by parameter name
    pub momentum: HashMap<String, Tensor>,
    pub saved_at: DateTime<Utc>,
}

/// Tensors of a foreign artifact used to initialise a model
#[derive(Debug, Clone)]
pub struct PretrainedArtifact {
    pub tensors: HashMap<String, Tensor>,
    /// Segment count recorded in the artifact, if any
    pub num_segments: Option<usize>,
}

/// Outcome of a partial pretrained load
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransplantReport {
    /// Model names copied from the artifact
    pub loaded: Vec<String>,
    /// Model names present in the artifact with a different shape
    pub shape_mismatch: Vec<String>,
    /// Model names absent from the artifact; left at their initial values
    pub missing: Vec<String>,
    /// Artifact names with no counterpart in the model
    pub unexpected: Vec<String>,
}

/// Owner of the "latest" and "best" checkpoint slots of one run
pub struct CheckpointManager {
    dir: PathBuf,
    run_name: String,
}

impl CheckpointManager {
    /// Manage the slots of `run_name` inside `dir`, creating it if needed
    pub fn new(dir: impl AsRef<Path>, run_name: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            run_name: run_name.into(),
        })
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Path of the slot rewritten every epoch
    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(format!("{}_checkpoint.safetensors", self.run_name))
    }

    /// Path of the best-so-far slot
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("{}_best.safetensors", self.run_name))
    }

    /// Write `checkpoint` to the latest slot and, if `is_best`, promote it.
    /// Returns the latest slot's path.
    pub fn save(&self, checkpoint: &TrainingCheckpoint, is_best: bool) -> Result<PathBuf> {
        let latest = self.latest_path();
        let bytes = encode(checkpoint)?;
        write_atomic(&latest, &bytes)?;
        debug!("Checkpoint for epoch {} written to {}", checkpoint.epoch, latest.display());

        if is_best {
            let best = self.best_path();
            let tmp = tmp_sibling(&best);
            fs::copy(&latest, &tmp)?;
            fs::rename(&tmp, &best)?;
            info!("New best checkpoint (Prec@1 {:.3}) at {}", checkpoint.best_prec1, best.display());
        }
        Ok(latest)
    }

    /// Read a checkpoint written by [`CheckpointManager::save`]
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<TrainingCheckpoint> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let (tensors, metadata) = decode(&bytes, device)?;

        let epoch = parse_meta::<usize>(&metadata, META_EPOCH, path)?;
        let best_prec1 = parse_meta::<f64>(&metadata, META_BEST_PREC1, path)?;
        let num_segments = parse_meta::<usize>(&metadata, META_NUM_SEGMENTS, path)?;
        let saved_at = DateTime::parse_from_rfc3339(meta(&metadata, META_SAVED_AT, path)?)
            .map_err(|e| Error::checkpoint(format!("bad '{}' metadata: {}", META_SAVED_AT, e)))?
            .with_timezone(&Utc);

        let mut state_dict = HashMap::new();
        let mut momentum = HashMap::new();
        for (name, tensor) in tensors {
            match name.strip_prefix(MOMENTUM_PREFIX) {
                Some(param) => {
                    momentum.insert(param.to_string(), tensor);
                }
                None => {
                    state_dict.insert(name, tensor);
                }
            }
        }

        Ok(TrainingCheckpoint {
            epoch,
            arch: meta(&metadata, META_ARCH, path)?.to_string(),
            consensus_type: meta(&metadata, META_CONSENSUS, path)?.to_string(),
            num_segments,
            best_prec1,
            state_dict,
            momentum,
            saved_at,
        })
    }

    /// Read any safetensors artifact for pretrained initialisation
    pub fn load_pretrained(path: impl AsRef<Path>, device: &Device) -> Result<PretrainedArtifact> {
        let bytes = fs::read(path.as_ref())?;
        let (mut tensors, metadata) = decode(&bytes, device)?;
        tensors.retain(|name, _| !name.starts_with(MOMENTUM_PREFIX));

        let num_segments = match metadata.get(META_NUM_SEGMENTS) {
            Some(raw) => Some(
                raw.parse::<usize>()
                    .map_err(|e| Error::checkpoint(format!("bad '{}' metadata: {}", META_NUM_SEGMENTS, e)))?,
            ),
            None => None,
        };
        Ok(PretrainedArtifact { tensors, num_segments })
    }
}

/// Fail when a pretrained source was trained with another segment count
pub fn check_segments(source: Option<usize>, configured: usize) -> Result<()> {
    match source {
        Some(n) if n != configured => Err(Error::incompatible_checkpoint(format!(
            "pretrained model uses {} segments, configured for {}",
            n, configured
        ))),
        _ => Ok(()),
    }
}

/// Load every tensor of `var_map` from `tensors`; names and shapes must match exactly
pub fn restore_state_dict(var_map: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter store lock poisoned"))?;

    let expected: BTreeSet<&str> = data.keys().map(String::as_str).collect();
    let found: BTreeSet<&str> = tensors.keys().map(String::as_str).collect();
    if expected != found {
        let missing: Vec<_> = expected.difference(&found).collect();
        let unexpected: Vec<_> = found.difference(&expected).collect();
        return Err(Error::incompatible_checkpoint(format!(
            "state dict mismatch, missing {:?}, unexpected {:?}",
            missing, unexpected
        )));
    }

    for (name, var) in data.iter() {
        let tensor = &tensors[name];
        if tensor.dims() != var.as_tensor().dims() {
            return Err(Error::incompatible_checkpoint(format!(
                "'{}' has shape {:?} in checkpoint, {:?} in model",
                name,
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
    }
    for (name, var) in data.iter() {
        let current = var.as_tensor();
        var.set(&tensors[name].to_dtype(current.dtype())?.to_device(current.device())?)?;
    }
    Ok(())
}

/// Copy the matching subset of `tensors` into `var_map`.
///
/// With `strip_prefix`, the first dotted component of every artifact name is
/// dropped first (`module.base.fc1.weight` -> `base.fc1.weight`). Parameters
/// whose shape differs, typically a classifier trained for another class
/// count, keep their current values.
pub fn transplant_pretrained(var_map: &VarMap, tensors: &HashMap<String, Tensor>, strip_prefix: bool) -> Result<TransplantReport> {
    let renamed: HashMap<String, &Tensor> = tensors
        .iter()
        .map(|(name, t)| {
            let key = if strip_prefix {
                name.split_once('.').map(|(_, rest)| rest.to_string()).unwrap_or_else(|| name.clone())
            } else {
                name.clone()
            };
            (key, t)
        })
        .collect();

    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter store lock poisoned"))?;

    let mut report = TransplantReport::default();
    for (name, var) in data.iter() {
        match renamed.get(name) {
            None => report.missing.push(name.clone()),
            Some(t) if t.dims() != var.as_tensor().dims() => report.shape_mismatch.push(name.clone()),
            Some(t) => {
                let current = var.as_tensor();
                var.set(&t.to_dtype(current.dtype())?.to_device(current.device())?)?;
                report.loaded.push(name.clone());
            }
        }
    }
    report.unexpected = renamed.keys().filter(|k| !data.contains_key(*k)).cloned().collect();

    report.loaded.sort();
    report.shape_mismatch.sort();
    report.missing.sort();
    report.unexpected.sort();

    if !report.shape_mismatch.is_empty() {
        warn!("Pretrained parameters with mismatched shape left initialised: {:?}", report.shape_mismatch);
    }
    Ok(report)
}

fn meta<'a>(metadata: &'a HashMap<String, String>, key: &str, path: &Path) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::checkpoint(format!("{} has no '{}' metadata", path.display(), key)))
}

fn parse_meta<T>(metadata: &HashMap<String, String>, key: &str, path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    meta(metadata, key, path)?
        .parse::<T>()
        .map_err(|e| Error::checkpoint(format!("bad '{}' metadata: {}", key, e)))
}

fn encode(checkpoint: &TrainingCheckpoint) -> Result<Vec<u8>> {
    let mut raw: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::new();
    for (name, tensor) in &checkpoint.state_dict {
        let (dtype, bytes) = tensor_bytes(tensor)?;
        raw.push((name.clone(), dtype, tensor.dims().to_vec(), bytes));
    }
    for (name, tensor) in &checkpoint.momentum {
        let (dtype, bytes) = tensor_bytes(tensor)?;
        raw.push((format!("{}{}", MOMENTUM_PREFIX, name), dtype, tensor.dims().to_vec(), bytes));
    }

    let views = raw
        .iter()
        .map(|(name, dtype, shape, bytes)| Ok((name.as_str(), TensorView::new(*dtype, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>>>()?;

    let metadata: HashMap<String, String> = [
        (META_EPOCH, checkpoint.epoch.to_string()),
        (META_ARCH, checkpoint.arch.clone()),
        (META_BEST_PREC1, checkpoint.best_prec1.to_string()),
        (META_NUM_SEGMENTS, checkpoint.num_segments.to_string()),
        (META_CONSENSUS, checkpoint.consensus_type.clone()),
        (META_SAVED_AT, checkpoint.saved_at.to_rfc3339()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    Ok(safetensors::serialize(views, &Some(metadata))?)
}

fn decode(bytes: &[u8], device: &Device) -> Result<(HashMap<String, Tensor>, HashMap<String, String>)> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let st = SafeTensors::deserialize(bytes)?;
    let mut tensors = HashMap::new();
    for (name, view) in st.tensors() {
        let dtype = match view.dtype() {
            Dtype::F32 => DType::F32,
            Dtype::F64 => DType::F64,
            Dtype::U32 => DType::U32,
            Dtype::I64 => DType::I64,
            other => return Err(Error::checkpoint(format!("unsupported dtype {:?} for '{}'", other, name))),
        };
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?;
        tensors.insert(name, tensor);
    }
    Ok((tensors, metadata))
}

fn tensor_bytes(tensor: &Tensor) -> Result<(Dtype, Vec<u8>)> {
    let flat = tensor.flatten_all()?;
    let encoded: (Dtype, Vec<u8>) = match tensor.dtype() {
        DType::F32 => (Dtype::F32, flat.to_vec1::<f32>()?.iter().flat_map(|v| v.to_le_bytes()).collect()),
        DType::F64 => (Dtype::F64, flat.to_vec1::<f64>()?.iter().flat_map(|v| v.to_le_bytes()).collect()),
        DType::U32 => (Dtype::U32, flat.to_vec1::<u32>()?.iter().flat_map(|v| v.to_le_bytes()).collect()),
        DType::I64 => (Dtype::I64, flat.to_vec1::<i64>()?.iter().flat_map(|v| v.to_le_bytes()).collect()),
        other => return Err(Error::checkpoint(format!("cannot persist {:?} tensors", other))),
    };
    Ok(encoded)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_sibling(path);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
