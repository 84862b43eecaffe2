//! Command-line surface and the resolved, immutable run configuration.

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{ArgAction, Parser};
use serde::Serialize;
use thiserror::Error;

use crate::{
    distributed::{CoordinatorConfig, ProcessTopology},
    model::{EncoderConfig, HeadConfig},
    optim::{OptimizerConfig, OptimizerKind},
};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--{flag}: {reason}")]
    Invalid { flag: &'static str, reason: String },
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serializing config: {0}")]
    Json(#[from] serde_json::Error),
}

fn invalid(flag: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        flag,
        reason: reason.into(),
    }
}

/// Accepts the `True`/`False` spellings used by the launch scripts.
fn parse_flag(value: &str) -> Result<bool, String> {
    match value {
        "True" | "true" => Ok(true),
        "False" | "false" => Ok(false),
        other => Err(format!("expected True or False, got {other}")),
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "simclr-finetune")]
#[command(version)]
#[command(about = "Data-parallel SimCLR fine-tuning of a dual encoder")]
pub struct Cli {
    /// Directory of training images
    #[arg(long = "train_dataset")]
    pub train_dataset: PathBuf,

    /// Directory of validation images, or None to skip validation
    #[arg(long = "val_dataset", default_value = "None")]
    pub val_dataset: String,

    /// Side length the augmented views are resized to
    #[arg(long, default_value_t = 224)]
    pub size: u32,

    /// Colour jitter strength
    #[arg(long, default_value_t = 1.0)]
    pub jitter: f32,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Lars)]
    pub optimizer: OptimizerKind,

    /// Learning rate; 0 selects 0.005 * sqrt(batch_size * world_size)
    #[arg(long, default_value_t = 0.0)]
    pub lr: f64,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    /// Per-device batch size
    #[arg(long = "batch_size", default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 0.1)]
    pub temperature: f64,

    #[arg(long = "weight_decay", default_value_t = 1e-6)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,

    #[arg(long, default_value = "False", value_parser = parse_flag, action = ArgAction::Set)]
    pub nesterov: bool,

    /// Cosine annealing over the epoch count
    #[arg(long, default_value = "True", value_parser = parse_flag, action = ArgAction::Set)]
    pub scheduler: bool,

    #[arg(long, default_value_t = 1)]
    pub nodes: usize,

    #[arg(long = "node_index", default_value_t = 0)]
    pub node_index: usize,

    /// Devices per node
    #[arg(long, default_value_t = 8)]
    pub gpus: usize,

    /// Loader threads per worker
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Metrics root; checkpoints go to a `_models` sibling
    #[arg(long = "log_dir")]
    pub log_dir: String,

    #[arg(long = "master_address", default_value = "localhost")]
    pub master_address: String,

    #[arg(long = "master_port", default_value = "12355")]
    pub master_port: String,

    #[arg(long, default_value_t = 123)]
    pub seed: u64,

    /// `original` for fresh weights, otherwise a checkpoint to start from
    #[arg(long, default_value = "original")]
    pub model: String,

    #[arg(long = "hidden_dim", default_value_t = 512)]
    pub hidden_dim: usize,

    #[arg(long = "feature_dim", default_value_t = 256)]
    pub feature_dim: usize,

    #[arg(long = "projection_dim", default_value_t = 128)]
    pub projection_dim: usize,

    /// Run only this device index (one process per device)
    #[arg(long = "local_rank")]
    pub local_rank: Option<usize>,

    /// Seconds before a stalled collective fails; 0 waits forever
    #[arg(long = "collective_timeout", default_value_t = 0)]
    pub collective_timeout: u64,
}

pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::try_parse_from(args)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Original,
    Checkpoint(PathBuf),
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    pub train_dataset: PathBuf,
    pub val_dataset: Option<PathBuf>,
    pub size: u32,
    pub jitter: f32,
    pub model: ModelSource,
    pub encoder: EncoderConfig,
    pub head: HeadConfig,
    pub optimizer: OptimizerConfig,
    pub scheduler: bool,
    pub epochs: usize,
    pub batch_size: usize,
    pub temperature: f64,
    pub nodes: usize,
    pub node_index: usize,
    pub gpus: usize,
    pub world_size: usize,
    pub local_rank: Option<usize>,
    pub workers: usize,
    pub log_dir: PathBuf,
    pub master_address: String,
    pub master_port: u16,
    pub seed: u64,
    pub collective_timeout_secs: Option<u64>,
}

/// Square-root scaling: `0.005 * sqrt(batch_size * world_size)` when `lr` is 0.
pub fn resolved_lr(lr: f64, batch_size: usize, world_size: usize) -> f64 {
    if lr == 0.0 {
        0.005 * ((batch_size * world_size) as f64).sqrt()
    } else {
        lr
    }
}

impl Cli {
    pub fn resolve(&self) -> Result<TrainConfig, ConfigError> {
        for (flag, value) in [
            ("nodes", self.nodes),
            ("gpus", self.gpus),
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("size", self.size as usize),
        ] {
            if value == 0 {
                return Err(invalid(flag, "must be at least 1"));
            }
        }
        if self.node_index >= self.nodes {
            return Err(invalid(
                "node_index",
                format!("{} is out of range for {} nodes", self.node_index, self.nodes),
            ));
        }
        if let Some(local_rank) = self.local_rank {
            if local_rank >= self.gpus {
                return Err(invalid(
                    "local_rank",
                    format!("{local_rank} is out of range for {} devices", self.gpus),
                ));
            }
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(invalid("temperature", "must be a positive number"));
        }
        if self.lr < 0.0 || !self.lr.is_finite() {
            return Err(invalid("lr", "must be a non-negative number"));
        }

        let log_dir = self.log_dir.strip_suffix('/').unwrap_or(&self.log_dir);
        if log_dir.is_empty() {
            return Err(invalid("log_dir", "must not be empty"));
        }
        let master_port = self
            .master_port
            .parse::<u16>()
            .map_err(|err| invalid("master_port", format!("{}: {err}", self.master_port)))?;

        let val_dataset = match self.val_dataset.as_str() {
            "None" => None,
            path => Some(PathBuf::from(path)),
        };
        let model = match self.model.as_str() {
            "original" => ModelSource::Original,
            path => ModelSource::Checkpoint(PathBuf::from(path)),
        };

        let world_size = self.nodes * self.gpus;
        let encoder =
            EncoderConfig::for_image(self.size as usize, self.hidden_dim, self.feature_dim);

        Ok(TrainConfig {
            train_dataset: self.train_dataset.clone(),
            val_dataset,
            size: self.size,
            jitter: self.jitter,
            model,
            encoder,
            head: HeadConfig {
                feature_dim: self.feature_dim,
                projection_dim: self.projection_dim,
            },
            optimizer: OptimizerConfig {
                kind: self.optimizer,
                lr: resolved_lr(self.lr, self.batch_size, world_size),
                weight_decay: self.weight_decay,
                momentum: self.momentum,
                nesterov: self.nesterov,
            },
            scheduler: self.scheduler,
            epochs: self.epochs,
            batch_size: self.batch_size,
            temperature: self.temperature,
            nodes: self.nodes,
            node_index: self.node_index,
            gpus: self.gpus,
            world_size,
            local_rank: self.local_rank,
            workers: self.workers,
            log_dir: PathBuf::from(log_dir),
            master_address: self.master_address.clone(),
            master_port,
            seed: self.seed,
            collective_timeout_secs: (self.collective_timeout > 0)
                .then_some(self.collective_timeout),
        })
    }
}

impl TrainConfig {
    pub fn topology(&self, local_rank: usize) -> ProcessTopology {
        ProcessTopology {
            nodes: self.nodes,
            devices_per_node: self.gpus,
            node_index: self.node_index,
            local_rank,
        }
    }

    /// Device indices this invocation runs: the one from `--local_rank`, or all of them.
    pub fn local_ranks(&self) -> Vec<usize> {
        match self.local_rank {
            Some(rank) => vec![rank],
            None => (0..self.gpus).collect(),
        }
    }

    pub fn coordinator(&self, rank: usize) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::new(
            self.master_address.clone(),
            self.master_port,
            rank,
            self.world_size,
        );
        config.timeout = self.collective_timeout_secs.map(Duration::from_secs);
        config
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
