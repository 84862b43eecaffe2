use std::{path::Path, sync::Arc, thread};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

use finetune::{
    autograd::{Rng, Tape},
    config::{Cli, ModelSource, TrainConfig},
    data::{DataLoader, Dataset, DistributedSampler, ImageDataset, Sampler},
    distributed::{broadcast_parameters, LocalProcessGroup, ProcessGroup, TcpProcessGroup},
    loss::NtXent,
    model::{DualEncoderModel, MlpEncoder, ProjectionHead},
    optim::build_optimizer,
    training::{RunOutputs, TrainingLoop},
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("finetune=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Cli::parse().resolve()?;
    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H:%M:%S").to_string();
    let local_ranks = config.local_ranks();

    if config.world_size == 1 {
        return run_worker(&config, 0, None, &timestamp);
    }
    if local_ranks.len() == 1 {
        return run_tcp_worker(&config, local_ranks[0], &timestamp);
    }

    // Every rank of a single-node run lives in this process.
    let local_groups = (config.nodes == 1).then(|| LocalProcessGroup::group(config.world_size));
    let results = thread::scope(|scope| {
        let handles = local_ranks
            .iter()
            .map(|&local_rank| {
                let config = &config;
                let timestamp = timestamp.as_str();
                let group = local_groups.as_ref().map(|groups| groups[local_rank].clone());
                let spawned = thread::Builder::new()
                    .name(format!("rank-{local_rank}"))
                    .spawn_scoped(scope, move || match group {
                        Some(group) => {
                            let guard = AbortOnFailure(&group);
                            let result = run_worker(config, local_rank, Some(&group), timestamp);
                            if result.is_err() {
                                guard.0.abort();
                            }
                            result
                        }
                        None => run_tcp_worker(config, local_rank, timestamp),
                    });
                if spawned.is_err() {
                    if let Some(groups) = &local_groups {
                        groups[local_rank].abort();
                    }
                }
                (local_rank, spawned)
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|(local_rank, spawned)| {
                let result = match spawned {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("worker thread panicked"))),
                    Err(err) => Err(anyhow::Error::new(err).context("spawning worker thread")),
                };
                (local_rank, result)
            })
            .collect::<Vec<_>>()
    });

    let origin = local_groups
        .as_ref()
        .and_then(|groups| groups.first())
        .and_then(LocalProcessGroup::aborted_by);
    let mut failure = None;
    for (local_rank, result) in results {
        if let Err(err) = result {
            error!(rank = local_rank, "worker failed: {err:#}");
            if failure.is_none() || origin == Some(local_rank) {
                failure = Some(err.context(format!("rank {local_rank} failed")));
            }
        }
    }
    failure.map_or(Ok(()), Err)
}

/// Aborts the in-process group if the owning worker unwinds, so its peers
/// stop waiting on a rank that will never arrive.
struct AbortOnFailure<'a>(&'a LocalProcessGroup);

impl Drop for AbortOnFailure<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

fn run_tcp_worker(config: &TrainConfig, local_rank: usize, timestamp: &str) -> Result<()> {
    let rank = config.topology(local_rank).global_rank();
    let group = TcpProcessGroup::setup(&config.coordinator(rank))
        .with_context(|| format!("setting up process group for rank {rank}"))?;
    let result = run_worker(config, local_rank, Some(&group), timestamp);
    let teardown = group.teardown();
    result?;
    teardown?;
    Ok(())
}

fn run_worker(
    config: &TrainConfig,
    local_rank: usize,
    group: Option<&dyn ProcessGroup>,
    timestamp: &str,
) -> Result<()> {
    let topology = config.topology(local_rank);
    let rank = topology.global_rank();
    let coordinator = topology.is_coordinator();
    let _span = info_span!("worker", rank).entered();

    let mut rng = Rng::new(config.seed);
    let mut tape = Tape::new();
    let encoder = MlpEncoder::new(&mut tape, &mut rng, config.encoder);
    let head = ProjectionHead::new(&mut tape, &mut rng, config.head);
    let model = match &config.model {
        ModelSource::Original => DualEncoderModel::new(encoder, head),
        ModelSource::Checkpoint(path) => DualEncoderModel::load(path, encoder, head, &mut tape)
            .with_context(|| format!("loading {}", path.display()))?,
    };
    let train_set: Arc<dyn Dataset> = Arc::new(open_dataset(&config.train_dataset, config)?);
    let val_set = match &config.val_dataset {
        Some(dir) => Some(open_dataset(dir, config)?),
        None => None,
    };
    let outputs = if coordinator {
        let log_dir = config.log_dir.join(timestamp);
        let outputs = RunOutputs::create(&log_dir)?;
        config.write(&log_dir)?;
        info!(log_dir = %log_dir.display(), "run directory created");
        Some(outputs)
    } else {
        None
    };

    let (optimizer, scheduler) = build_optimizer(&tape, config.epochs, &config.optimizer);
    let scheduler = config.scheduler.then_some(scheduler);
    info!(
        lr = config.optimizer.lr,
        optimizer = ?config.optimizer.kind,
        world_size = config.world_size,
        "optimizer ready"
    );

    let sampler = match group {
        Some(group) => Sampler::Distributed(DistributedSampler::new(
            train_set.len(),
            group.world_size(),
            rank,
            true,
            config.seed,
        )),
        None => Sampler::Random { seed: config.seed },
    };
    let train_loader = DataLoader::new(
        train_set,
        config.batch_size,
        sampler,
        true,
        config.workers,
        config.seed.wrapping_add(rank as u64),
    )?;

    let val_loader = match val_set {
        Some(val_set) if coordinator => {
            let val_set: Arc<dyn Dataset> = Arc::new(val_set);
            Some(DataLoader::new(
                val_set,
                config.batch_size,
                Sampler::Sequential,
                false,
                config.workers,
                config.seed,
            )?)
        }
        _ => None,
    };

    // First collective: every fallible setup step above has already run.
    if let Some(group) = group {
        broadcast_parameters(&mut tape, group)?;
    }

    let mut training = TrainingLoop {
        tape,
        model,
        criterion: Box::new(NtXent::new(config.temperature)),
        optimizer,
        scheduler,
        train_loader,
        val_loader,
        group,
        outputs,
    };

    if coordinator {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        println!("{now} : Starting training for {} epochs.", config.epochs);
    }
    training.run(config.epochs)?;
    if coordinator {
        println!("Training ended.");
    }
    Ok(())
}

fn open_dataset(dir: &Path, config: &TrainConfig) -> Result<ImageDataset> {
    ImageDataset::open(dir, config.size, config.jitter)
        .with_context(|| format!("opening dataset {}", dir.display()))
}
