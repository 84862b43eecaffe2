use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    autograd::Tape,
    checkpoint::CheckpointError,
    data::{DataError, DataLoader},
    distributed::{all_reduce_average, sync_gradients, CollectiveError, ProcessGroup},
    loss::Criterion,
    metrics::{MetricsError, SummaryWriter},
    model::{DualEncoderModel, Module},
    optim::{CosineAnnealingLr, LrScheduler, Optimizer},
};

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("{split} loader yields no batches")]
    EmptyLoader { split: &'static str },
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Collective(#[from] CollectiveError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("creating {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: Option<f64>,
    pub lr: f64,
}

/// One optimisation pass. Returns the mean of the per-batch losses; under a
/// process group that mean is further averaged across ranks, so every rank
/// must call this for every epoch.
pub fn train_one_epoch<E: Module, H: Module>(
    tape: &mut Tape,
    model: &DualEncoderModel<E, H>,
    loader: &mut DataLoader,
    criterion: &dyn Criterion,
    optimizer: &mut dyn Optimizer,
    group: Option<&dyn ProcessGroup>,
) -> Result<f64, TrainingError> {
    if loader.is_empty() {
        return Err(TrainingError::EmptyLoader { split: "training" });
    }

    let mut running_loss = 0.0;
    let mut batches = 0_usize;
    for batch in loader.iter() {
        let batch = batch?;
        tape.reset();
        let (z1, z2) = model.forward(tape, &batch.first, &batch.second);
        let loss = criterion.loss(tape, &z1, &z2);
        let value = tape.scalar(loss);
        tape.backward(loss);
        if let Some(group) = group {
            sync_gradients(tape, group)?;
        }
        optimizer.step(tape);

        running_loss += value;
        batches += 1;
        debug!(batch = batches, loss = value, "train step");
    }
    tape.clear_activations();

    let mean = running_loss / batches as f64;
    match group {
        Some(group) => Ok(all_reduce_average(group, mean)?),
        None => Ok(mean),
    }
}

/// Forward passes only, with gradient recording switched off.
pub fn validate_one_epoch<E: Module, H: Module>(
    tape: &mut Tape,
    model: &DualEncoderModel<E, H>,
    loader: &mut DataLoader,
    criterion: &dyn Criterion,
) -> Result<f64, TrainingError> {
    if loader.is_empty() {
        return Err(TrainingError::EmptyLoader {
            split: "validation",
        });
    }

    let was_enabled = tape.grad_enabled();
    tape.reset();
    tape.set_grad_enabled(false);
    let result = evaluate(tape, model, loader, criterion);
    tape.set_grad_enabled(was_enabled);
    tape.clear_activations();
    result
}

fn evaluate<E: Module, H: Module>(
    tape: &mut Tape,
    model: &DualEncoderModel<E, H>,
    loader: &mut DataLoader,
    criterion: &dyn Criterion,
) -> Result<f64, TrainingError> {
    let mut running_loss = 0.0;
    let mut batches = 0_usize;
    for batch in loader.iter() {
        let batch = batch?;
        tape.clear_activations();
        let (z1, z2) = model.forward(tape, &batch.first, &batch.second);
        let loss = criterion.loss(tape, &z1, &z2);
        running_loss += tape.scalar(loss);
        batches += 1;
    }
    Ok(running_loss / batches as f64)
}

/// `runs/exp1` at epoch index 4 → `runs_models/exp1/epoch_5.pth`.
pub fn checkpoint_path(run_log_dir: &Path, epoch: usize) -> PathBuf {
    models_dir(run_log_dir).join(format!("epoch_{}.pth", epoch + 1))
}

/// Sibling of the run's metrics directory: `<parent>_models/<run name>`.
pub fn models_dir(run_log_dir: &Path) -> PathBuf {
    let mut parent = run_log_dir
        .parent()
        .map(|p| p.as_os_str().to_os_string())
        .unwrap_or_default();
    parent.push("_models");
    let name = run_log_dir.file_name().unwrap_or_default();
    PathBuf::from(parent).join(name)
}

pub fn status_line(timestamp: &str, summary: &EpochSummary) -> String {
    match summary.val_loss {
        Some(val_loss) => format!(
            "{timestamp} : Epoch {} --- train_loss : {:.3}, val_loss : {val_loss:.3}",
            summary.epoch, summary.train_loss
        ),
        None => format!(
            "{timestamp} : Epoch {} --- train_loss : {:.3}",
            summary.epoch, summary.train_loss
        ),
    }
}

/// Where rank 0 writes: the metrics sink and, derived from its directory,
/// the checkpoint directory.
#[derive(Debug)]
pub struct RunOutputs {
    pub writer: SummaryWriter,
}

impl RunOutputs {
    pub fn create(log_dir: &Path) -> Result<Self, TrainingError> {
        let writer = SummaryWriter::create(log_dir)?;
        let models = models_dir(log_dir);
        fs::create_dir_all(&models).map_err(|source| TrainingError::Io {
            path: models.clone(),
            source,
        })?;
        Ok(Self { writer })
    }

    fn record(&self, summary: &EpochSummary) -> Result<(), MetricsError> {
        self.writer
            .add_scalar("Loss/train", summary.train_loss, summary.epoch)?;
        if let Some(val_loss) = summary.val_loss {
            self.writer
                .add_scalar("Loss/validation", val_loss, summary.epoch)?;
        }
        self.writer
            .add_scalar("Misc/learning_rate", summary.lr, summary.epoch)
    }
}

/// Everything one rank needs for a run. Every rank executes [`run`] with the
/// same epoch count; only the coordinator validates, logs and checkpoints.
///
/// [`run`]: TrainingLoop::run
pub struct TrainingLoop<'g, E, H> {
    pub tape: Tape,
    pub model: DualEncoderModel<E, H>,
    pub criterion: Box<dyn Criterion>,
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: Option<CosineAnnealingLr>,
    pub train_loader: DataLoader,
    pub val_loader: Option<DataLoader>,
    pub group: Option<&'g dyn ProcessGroup>,
    /// Set on the coordinator only.
    pub outputs: Option<RunOutputs>,
}

impl<E: Module, H: Module> TrainingLoop<'_, E, H> {
    pub fn is_coordinator(&self) -> bool {
        self.group.map_or(true, |g| g.is_coordinator())
    }

    pub fn run(&mut self, epochs: usize) -> Result<Vec<EpochSummary>, TrainingError> {
        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            if self.group.is_some() {
                self.train_loader.set_epoch(epoch);
            }

            self.model.set_training(true);
            let train_loss = train_one_epoch(
                &mut self.tape,
                &self.model,
                &mut self.train_loader,
                self.criterion.as_ref(),
                self.optimizer.as_mut(),
                self.group,
            )?;

            let lr = match self.scheduler.as_mut() {
                Some(scheduler) => {
                    let lr = scheduler.get_lr();
                    scheduler.step();
                    scheduler.apply(self.optimizer.as_mut());
                    lr
                }
                None => self.optimizer.lr(),
            };

            let coordinator = self.is_coordinator();
            let val_loss = match self.val_loader.as_mut() {
                Some(loader) if coordinator => {
                    self.model.set_training(false);
                    Some(validate_one_epoch(
                        &mut self.tape,
                        &self.model,
                        loader,
                        self.criterion.as_ref(),
                    )?)
                }
                _ => None,
            };

            let summary = EpochSummary {
                epoch,
                train_loss,
                val_loss,
                lr,
            };
            if coordinator {
                self.report(&summary)?;
            }

            if let Some(group) = self.group {
                group.barrier()?;
            }
            history.push(summary);
        }
        Ok(history)
    }

    fn report(&self, summary: &EpochSummary) -> Result<(), TrainingError> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        println!("{}", status_line(&timestamp, summary));

        if let Some(outputs) = &self.outputs {
            outputs.record(summary)?;
            let path = checkpoint_path(outputs.writer.log_dir(), summary.epoch);
            self.model.save(&self.tape, &path)?;
            info!(epoch = summary.epoch, path = %path.display(), "checkpoint saved");
        }
        Ok(())
    }
}
