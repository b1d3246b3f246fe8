//! Epoch loop for TRN video classifiers
//!
//! [`Trainer`] owns everything a run mutates: the model, the grouped SGD
//! optimizer, the step-decay schedule, the checkpoint slots and the progress
//! log. Each epoch runs the scheduler, one training phase, one validation
//! phase, the best-model check and a checkpoint write, in that order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{state_dict, ModelMode, NoGradScope, VideoClassifier};
use crate::training::checkpoints::{
    check_segments, restore_state_dict, transplant_pretrained, CheckpointManager, TrainingCheckpoint,
    TransplantReport,
};
use crate::training::config::TrainingConfig;
use crate::training::data::BatchLoader;
use crate::training::loss::Criterion;
use crate::training::metrics::{topk_precision, History, PhaseMeters, PhaseMetrics};
use crate::training::optimizers::{GradientClipper, GroupHyperParams, GroupedSgd, StepDecayScheduler};
use crate::training::progress::ProgressLog;

/// State carried across epochs and persisted in checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Next epoch to run
    pub epoch: usize,

    /// Best validation top-1 precision seen so far
    pub best_prec1: f64,
}

/// Result of a resume request
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// State restored; training continues at `epoch`
    Resumed { epoch: usize, best_prec1: f64 },
    /// No artifact at the path; training starts from scratch
    NotFound(PathBuf),
}

/// What a full run produced
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Evaluate-only mode
    Evaluated(PhaseMetrics),
    /// Learning curves of the epochs run
    Trained(History),
}

/// Trainer for a [`VideoClassifier`]
pub struct Trainer<M: VideoClassifier> {
    config: TrainingConfig,
    model: M,
    optimizer: GroupedSgd,
    scheduler: StepDecayScheduler,
    criterion: Criterion,
    clipper: GradientClipper,
    checkpoints: CheckpointManager,
    log: ProgressLog,
    state: TrainingState,
    device: Device,
}

impl<M: VideoClassifier> Trainer<M> {
    /// Validate `config`, create the run folders and open the progress log
    pub fn new(config: TrainingConfig, model: M, device: Device) -> Result<Self> {
        config.validate()?;
        config.ensure_root_folders()?;
        let log = ProgressLog::create(config.log_path())?;
        Self::with_progress_log(config, model, device, log)
    }

    /// Same as [`Trainer::new`] with a caller-supplied log sink
    pub fn with_progress_log(config: TrainingConfig, model: M, device: Device, log: ProgressLog) -> Result<Self> {
        config.validate()?;
        let criterion = Criterion::new(config.loss_type()?);

        let policies = model.optim_policies();
        for group in &policies {
            info!(
                "group: {} has {} params, lr_mult: {}, decay_mult: {}",
                group.name(),
                group.params().len(),
                group.lr_mult(),
                group.decay_mult()
            );
        }

        let opt = &config.optimizer;
        let optimizer = GroupedSgd::new(policies, opt.learning_rate, opt.momentum, opt.weight_decay)?;
        let scheduler = StepDecayScheduler::new(opt.learning_rate, opt.lr_steps.clone(), opt.weight_decay)?;
        let clipper = GradientClipper::new(opt.clip_gradient);
        let checkpoints = CheckpointManager::new(&config.paths.root_model, config.run_name())?;

        let state = TrainingState {
            epoch: config.training.start_epoch,
            best_prec1: 0.0,
        };

        Ok(Self {
            config,
            model,
            optimizer,
            scheduler,
            criterion,
            clipper,
            checkpoints,
            log,
            state,
            device,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &GroupedSgd {
        &self.optimizer
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Live learning rate of every parameter group
    pub fn group_lrs(&self) -> Vec<f64> {
        self.optimizer.groups().iter().map(|g| g.lr).collect()
    }

    /// Transplant the configured pretrained weights, if any
    pub fn load_pretrained(&mut self) -> Result<Option<TransplantReport>> {
        let Some(pretrained) = self.config.model.pretrained.clone() else {
            return Ok(None);
        };

        info!("loading pretrained weights from '{}'", pretrained.path.display());
        let artifact = CheckpointManager::load_pretrained(&pretrained.path, &self.device)?;
        check_segments(artifact.num_segments.or(pretrained.num_segments), self.config.model.num_segments)?;

        let report = transplant_pretrained(self.model.var_map(), &artifact.tensors, pretrained.strip_prefix)?;
        info!(
            "pretrained transplant: {} loaded, {} shape mismatches, {} missing, {} unexpected",
            report.loaded.len(),
            report.shape_mismatch.len(),
            report.missing.len(),
            report.unexpected.len()
        );
        Ok(Some(report))
    }

    /// Restore model, optimizer and loop state from `path`.
    ///
    /// A missing file is not an error: the run starts from scratch.
    pub fn resume(&mut self, path: impl AsRef<Path>) -> Result<ResumeOutcome> {
        let path = path.as_ref();
        if !path.is_file() {
            warn!("no checkpoint found at '{}'", path.display());
            return Ok(ResumeOutcome::NotFound(path.to_path_buf()));
        }

        info!("loading checkpoint '{}'", path.display());
        let checkpoint = CheckpointManager::load(path, &self.device)?;
        if checkpoint.arch != self.config.model.arch {
            return Err(Error::incompatible_checkpoint(format!(
                "checkpoint was trained with {}, configured for {}",
                checkpoint.arch, self.config.model.arch
            )));
        }
        if checkpoint.consensus_type != self.config.model.consensus_type {
            return Err(Error::incompatible_checkpoint(format!(
                "checkpoint uses {} consensus, configured for {}",
                checkpoint.consensus_type, self.config.model.consensus_type
            )));
        }
        if checkpoint.num_segments != self.config.model.num_segments {
            return Err(Error::incompatible_checkpoint(format!(
                "checkpoint uses {} segments, configured for {}",
                checkpoint.num_segments, self.config.model.num_segments
            )));
        }

        restore_state_dict(self.model.var_map(), &checkpoint.state_dict)?;
        self.optimizer.load_momentum_buffers(checkpoint.momentum)?;
        self.state = TrainingState {
            epoch: checkpoint.epoch,
            best_prec1: checkpoint.best_prec1,
        };

        info!("loaded checkpoint '{}' (epoch {})", path.display(), checkpoint.epoch);
        Ok(ResumeOutcome::Resumed {
            epoch: checkpoint.epoch,
            best_prec1: checkpoint.best_prec1,
        })
    }

    /// Resume from `training.resume` when configured
    pub fn resume_from_config(&mut self) -> Result<Option<ResumeOutcome>> {
        match self.config.training.resume.clone() {
            Some(path) => self.resume(path).map(Some),
            None => Ok(None),
        }
    }

    /// Evaluate-only or full training, depending on `training.evaluate`
    pub fn run(&mut self, train: &mut dyn BatchLoader, val: &mut dyn BatchLoader) -> Result<RunOutcome> {
        if self.config.training.evaluate {
            return self.validate(val).map(RunOutcome::Evaluated);
        }
        self.fit(train, val).map(RunOutcome::Trained)
    }

    /// Run epochs `[state.epoch, training.epochs)`
    pub fn fit(&mut self, train: &mut dyn BatchLoader, val: &mut dyn BatchLoader) -> Result<History> {
        let total = self.config.training.epochs;
        let mut history = History::starting_at(self.state.epoch);
        info!("training epochs {}..{} of {}", self.state.epoch, total, self.config.run_name());

        for epoch in self.state.epoch..total {
            self.adjust_learning_rate(epoch)?;

            let train_metrics = self.train_epoch(train, epoch)?;
            let val_metrics = self.validate(val)?;
            history.push(train_metrics.as_pair(), val_metrics.as_pair());

            let is_best = val_metrics.top1 > self.state.best_prec1;
            self.state.best_prec1 = self.state.best_prec1.max(val_metrics.top1);
            self.state.epoch = epoch + 1;
            self.save_checkpoint(is_best)?;
        }

        info!("training finished, best Prec@1 {:.3}", self.state.best_prec1);
        Ok(history)
    }

    /// Rewrite every group's live learning rate and weight decay for `epoch`
    pub fn adjust_learning_rate(&mut self, epoch: usize) -> Result<Vec<GroupHyperParams>> {
        self.scheduler.apply(epoch, &mut self.optimizer)
    }

    /// One pass over the training batches of `epoch`
    pub fn train_epoch(&mut self, loader: &mut dyn BatchLoader, epoch: usize) -> Result<PhaseMetrics> {
        self.model.set_partial_bn(self.config.model.partial_bn);
        self.model.set_mode(ModelMode::Train);

        let print_freq = self.config.training.print_freq;
        let num_batches = loader.num_batches();
        let vars = self.optimizer.all_vars();
        let mut meters = PhaseMeters::new();
        let mut processed = 0;

        let mut end = Instant::now();
        for (i, batch) in loader.epoch_batches(epoch)?.enumerate() {
            let batch = batch?;
            meters.data_time.update(end.elapsed().as_secs_f64(), 1);
            let size = batch.size()?;

            let output = self.model.forward(&batch.input)?;
            let loss = self.criterion.compute(&output, &batch.target)?;
            let prec = topk_precision(&output, &batch.target, &[1])?;
            meters.losses.update(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?, size);
            meters.top1.update(prec.get(&1).copied().unwrap_or(0.0), size);

            let mut grads = loss.backward()?;
            self.clipper.apply(&vars, &mut grads)?;
            self.optimizer.step(&grads)?;

            meters.batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();
            processed += 1;

            if i % print_freq == 0 {
                self.log.line(&format!(
                    "Epoch: [{}][{}/{}], lr: {:.5}\tTime {:.3} ({:.3})\tData {:.3} ({:.3})\tLoss {:.4} ({:.4})\tPrec@1 {:.3} ({:.3})",
                    epoch,
                    i,
                    num_batches,
                    self.optimizer.last_group_lr(),
                    meters.batch_time.val,
                    meters.batch_time.avg,
                    meters.data_time.val,
                    meters.data_time.avg,
                    meters.losses.val,
                    meters.losses.avg,
                    meters.top1.val,
                    meters.top1.avg
                ))?;
            }
        }

        debug!("epoch {} trained on {} batches", epoch, processed);
        Ok(meters.finish(processed))
    }

    /// One gradient-free pass over the validation batches
    pub fn validate(&mut self, loader: &mut dyn BatchLoader) -> Result<PhaseMetrics> {
        let print_freq = self.config.training.print_freq;
        let num_batches = loader.num_batches();
        let mut meters = PhaseMeters::new();
        let mut processed = 0;

        {
            let mut model = NoGradScope::new(&mut self.model);
            model.set_mode(ModelMode::Eval);

            let mut end = Instant::now();
            for (i, batch) in loader.epoch_batches(0)?.enumerate() {
                let batch = batch?;
                let size = batch.size()?;

                let output = model.forward(&batch.input)?;
                let loss = self.criterion.compute(&output, &batch.target)?.detach();
                let prec = topk_precision(&output, &batch.target, &[1])?;
                meters.losses.update(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?, size);
                meters.top1.update(prec.get(&1).copied().unwrap_or(0.0), size);

                meters.batch_time.update(end.elapsed().as_secs_f64(), 1);
                end = Instant::now();
                processed += 1;

                if i % print_freq == 0 {
                    self.log.line(&format!(
                        "Test: [{}/{}]\tTime {:.3} ({:.3})\tLoss {:.4} ({:.4})\tPrec@1 {:.3} ({:.3})",
                        i,
                        num_batches,
                        meters.batch_time.val,
                        meters.batch_time.avg,
                        meters.losses.val,
                        meters.losses.avg,
                        meters.top1.val,
                        meters.top1.avg
                    ))?;
                }
            }
        }

        let metrics = meters.finish(processed);
        let best = self.state.best_prec1.max(metrics.top1);
        self.log.line(&format!(
            "Testing Results: Prec@1 {:.3} Loss {:.5}",
            metrics.top1, metrics.loss
        ))?;
        self.log.line(&format!("Best Prec@1: {:.3}", best))?;
        Ok(metrics)
    }

    /// Persist the current state to the latest slot, promoting it when `is_best`
    pub fn save_checkpoint(&self, is_best: bool) -> Result<PathBuf> {
        let checkpoint = TrainingCheckpoint {
            epoch: self.state.epoch,
            arch: self.config.model.arch.clone(),
            consensus_type: self.config.model.consensus_type.clone(),
            num_segments: self.config.model.num_segments,
            best_prec1: self.state.best_prec1,
            state_dict: state_dict(self.model.var_map())?.into_iter().collect::<HashMap<_, _>>(),
            momentum: self.optimizer.momentum_buffers().clone(),
            saved_at: Utc::now(),
        };
        self.checkpoints.save(&checkpoint, is_best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use crate::models::{SegmentConsensusNet, SegmentConsensusNetConfig};
    use crate::training::config::PathsConfig;
    use crate::training::data::{Batch, DataLoader, DataLoaderConfig, InMemoryDataset, SyntheticClips, SyntheticClipsConfig};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.model.arch = "resnet101".to_string();
        config.model.num_segments = 2;
        config.model.num_class = 3;
        config.model.img_feature_dim = 8;
        config.training.epochs = 2;
        config.training.batch_size = 4;
        config.training.print_freq = 2;
        config.optimizer.learning_rate = 0.01;
        config.optimizer.lr_steps = vec![1];
        config.paths = PathsConfig {
            root_log: dir.path().join("log"),
            root_model: dir.path().join("model"),
            root_output: dir.path().join("output"),
        };
        config
    }

    fn trainer(config: TrainingConfig) -> Trainer<SegmentConsensusNet> {
        let model = SegmentConsensusNet::new(
            SegmentConsensusNetConfig {
                num_segments: 2,
                feature_dim: 6,
                hidden_dim: 8,
                num_class: 3,
                seed: 1,
            },
            &Device::Cpu,
        )
        .unwrap();
        Trainer::with_progress_log(config, model, Device::Cpu, ProgressLog::sink()).unwrap()
    }

    fn loader(num_clips: usize, seed: u64) -> DataLoader<InMemoryDataset> {
        let data = SyntheticClips::generate(
            &SyntheticClipsConfig {
                num_clips,
                num_segments: 2,
                feature_dim: 6,
                num_class: 3,
                noise: 10.0,
                seed,
            },
            &crate::models::ArchProfile::for_arch("resnet101"),
            &Device::Cpu,
        )
        .unwrap();
        let config = DataLoaderConfig {
            batch_size: 4,
            shuffle: false,
            drop_last: false,
            seed,
        };
        DataLoader::new(data, config, Device::Cpu).unwrap()
    }

    struct EmptyLoader;

    impl BatchLoader for EmptyLoader {
        fn num_batches(&self) -> usize {
            0
        }

        fn epoch_batches(&mut self, _epoch: usize) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[test]
    fn test_initial_group_lrs_follow_multipliers() {
        let dir = TempDir::new().unwrap();
        let trainer = trainer(config(&dir));
        assert_eq!(trainer.group_lrs(), vec![0.01, 0.02, 0.01, 0.02]);
    }

    #[test]
    fn test_empty_phase_returns_zero() {
        let dir = TempDir::new().unwrap();
        let mut trainer = trainer(config(&dir));
        let metrics = trainer.validate(&mut EmptyLoader).unwrap();
        assert_eq!(metrics, PhaseMetrics::default());
    }

    #[test]
    fn test_metrics_returned_regardless_of_print_freq() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.training.print_freq = 100;
        let mut trainer = trainer(cfg);

        // 10 clips in batches of 4: the last batch index is 2, never a multiple of 100
        let metrics = trainer.train_epoch(&mut loader(10, 1), 0).unwrap();
        assert_eq!(metrics.batches, 3);
        assert!(metrics.loss > 0.0);
    }

    #[test]
    fn test_validate_leaves_parameters_and_statistics_untouched() {
        let dir = TempDir::new().unwrap();
        let mut trainer = trainer(config(&dir));
        let before = state_dict(trainer.model().var_map()).unwrap();

        trainer.validate(&mut loader(8, 2)).unwrap();

        let after = state_dict(trainer.model().var_map()).unwrap();
        for ((name, a), (_, b)) in before.iter().zip(after.iter()) {
            let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            assert_eq!(diff, 0.0, "{} changed during validation", name);
        }
        assert!(trainer.model().grad_enabled());
    }

    #[test]
    fn test_fit_writes_checkpoints_and_tracks_best() {
        let dir = TempDir::new().unwrap();
        let mut trainer = trainer(config(&dir));

        let history = trainer.fit(&mut loader(12, 1), &mut loader(6, 2)).unwrap();
        assert_eq!(history.len(), 2);

        let state = trainer.state();
        assert_eq!(state.epoch, 2);
        let best_seen = history.val_acc.iter().cloned().fold(0.0, f64::max);
        assert_eq!(state.best_prec1, best_seen);

        let latest = CheckpointManager::load(trainer.checkpoints().latest_path(), &Device::Cpu).unwrap();
        assert_eq!(latest.epoch, 2);
        assert_eq!(latest.best_prec1, best_seen);
        assert_eq!(trainer.group_lrs(), vec![0.001, 0.002, 0.001, 0.002]);
    }

    #[test]
    fn test_resume_missing_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let mut trainer = trainer(config(&dir));
        let missing = dir.path().join("nope.safetensors");

        let outcome = trainer.resume(&missing).unwrap();
        assert_eq!(outcome, ResumeOutcome::NotFound(missing));
        assert_eq!(trainer.state().epoch, 0);
    }

    #[test]
    fn test_resume_rejects_other_segment_count() {
        let dir = TempDir::new().unwrap();
        let mut source = trainer(config(&dir));
        source.fit(&mut loader(4, 1), &mut loader(4, 2)).unwrap();
        let path = source.checkpoints().latest_path();

        let mut cfg = config(&dir);
        cfg.model.num_segments = 3;
        let model = SegmentConsensusNet::new(
            SegmentConsensusNetConfig {
                num_segments: 3,
                feature_dim: 6,
                hidden_dim: 8,
                num_class: 3,
                seed: 1,
            },
            &Device::Cpu,
        )
        .unwrap();
        let mut other = Trainer::with_progress_log(cfg, model, Device::Cpu, ProgressLog::sink()).unwrap();
        assert!(matches!(other.resume(&path), Err(Error::IncompatibleCheckpoint(_))));
    }

    #[test]
    fn test_resume_rejects_other_consensus_type() {
        let dir = TempDir::new().unwrap();
        let source = trainer(config(&dir));
        let path = source.save_checkpoint(false).unwrap();

        let mut cfg = config(&dir);
        cfg.model.consensus_type = "TRN".to_string();
        let mut other = trainer(cfg);
        assert!(matches!(other.resume(&path), Err(Error::IncompatibleCheckpoint(_))));
        assert_eq!(other.state().epoch, 0);
    }

    #[test]
    fn test_train_epoch_clips_update_to_max_norm() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.optimizer.learning_rate = 1.0;
        cfg.optimizer.momentum = 0.0;
        cfg.optimizer.weight_decay = 0.0;
        cfg.optimizer.clip_gradient = Some(1e-2);
        let mut trainer = trainer(cfg);

        let snapshot = |t: &Trainer<SegmentConsensusNet>| -> Vec<(f64, Vec<f32>)> {
            t.optimizer()
                .groups()
                .iter()
                .flat_map(|g| {
                    g.params()
                        .iter()
                        .map(|(_, v)| (g.lr, v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        let before = snapshot(&trainer);

        // one batch, hence one step
        let metrics = trainer.train_epoch(&mut loader(4, 1), 0).unwrap();
        assert_eq!(metrics.batches, 1);
        let after = snapshot(&trainer);

        // p -= lr * g, so the applied gradient is the update divided by the group lr
        let applied_sq: f64 = before
            .iter()
            .zip(after.iter())
            .flat_map(|((lr, a), (_, b))| a.iter().zip(b.iter()).map(move |(x, y)| ((x - y) as f64 / lr).powi(2)))
            .sum();
        let applied = applied_sq.sqrt();
        assert!(applied <= 1e-2 * 1.01, "applied gradient norm {} exceeds max_norm", applied);
        assert!(applied >= 1e-2 * 0.99, "gradient was not rescaled to max_norm: {}", applied);
    }

    struct MalformedLoader;

    impl BatchLoader for MalformedLoader {
        fn num_batches(&self) -> usize {
            1
        }

        fn epoch_batches(&mut self, _epoch: usize) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>> {
            let batch = Batch {
                input: Tensor::zeros((2, 2, 5), DType::F32, &Device::Cpu)?,
                target: Tensor::new(&[0u32, 1], &Device::Cpu)?,
            };
            Ok(Box::new(std::iter::once(Ok(batch))))
        }
    }

    #[test]
    fn test_validate_error_restores_grad_tracking() {
        let dir = TempDir::new().unwrap();
        let mut trainer = trainer(config(&dir));

        let err = trainer.validate(&mut MalformedLoader).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(trainer.model().grad_enabled());

        // the trainer stays usable afterwards
        let metrics = trainer.train_epoch(&mut loader(4, 1), 0).unwrap();
        assert_eq!(metrics.batches, 1);
    }

    #[test]
    fn test_evaluate_mode_runs_single_pass() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.training.evaluate = true;
        let mut trainer = trainer(cfg);

        let outcome = trainer.run(&mut loader(4, 1), &mut loader(4, 2)).unwrap();
        assert!(matches!(outcome, RunOutcome::Evaluated(m) if m.batches == 1));
        assert!(!trainer.checkpoints().latest_path().exists());
    }
}
