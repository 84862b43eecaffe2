use std::{path::Path, sync::Arc, thread};

use finetune::{
    autograd::{Rng, Tape},
    data::{DataLoader, Dataset, DistributedSampler, ImageDataset, Sampler},
    distributed::{broadcast_parameters, CollectiveError, LocalProcessGroup, ProcessGroup},
    loss::NtXent,
    metrics::{read_scalars, SCALARS_FILE},
    model::{DualEncoderModel, EncoderConfig, HeadConfig, MlpEncoder, ProjectionHead},
    optim::{build_optimizer, OptimizerConfig, OptimizerKind},
    training::{
        checkpoint_path, models_dir, EpochSummary, RunOutputs, TrainingError, TrainingLoop,
    },
};
use image::{Rgb, RgbImage};

const SIZE: u32 = 8;
const EPOCHS: usize = 2;
const WORLD: usize = 2;

fn write_images(dir: &Path, count: usize) {
    std::fs::create_dir_all(dir).expect("mkdir");
    for i in 0..count {
        let shade = (i * 30) as u8;
        let image = RgbImage::from_fn(12, 12, |x, y| {
            Rgb([shade, (x * 20) as u8, (y * 20) as u8 ^ shade])
        });
        image.save(dir.join(format!("img_{i:02}.png"))).expect("save png");
    }
}

fn build(tape: &mut Tape, seed: u64) -> DualEncoderModel<MlpEncoder, ProjectionHead> {
    let mut rng = Rng::new(seed);
    // per-rank seeds differ on purpose; the initial broadcast aligns them
    let encoder = MlpEncoder::new(tape, &mut rng, EncoderConfig::for_image(SIZE as usize, 6, 5));
    let head = ProjectionHead::new(
        tape,
        &mut rng,
        HeadConfig {
            feature_dim: 5,
            projection_dim: 4,
        },
    );
    DualEncoderModel::new(encoder, head)
}

struct RankResult {
    history: Vec<EpochSummary>,
    params: Vec<Vec<f64>>,
}

fn run_rank(group: LocalProcessGroup, data: &Path, log_dir: &Path) -> RankResult {
    let rank = group.rank();
    let mut tape = Tape::new();
    let model = build(&mut tape, 100 + rank as u64);
    broadcast_parameters(&mut tape, &group).expect("broadcast");

    let config = OptimizerConfig {
        kind: OptimizerKind::Lars,
        lr: 0.5,
        weight_decay: 1e-6,
        momentum: 0.9,
        nesterov: false,
    };
    let (optimizer, scheduler) = build_optimizer(&tape, EPOCHS, &config);

    let train_set: Arc<dyn Dataset> = Arc::new(ImageDataset::open(data, SIZE, 1.0).expect("open"));
    let sampler = DistributedSampler::new(train_set.len(), WORLD, rank, true, 7);
    let train_loader =
        DataLoader::new(train_set, 2, Sampler::Distributed(sampler), true, 2, 7 + rank as u64)
            .expect("train loader");

    let coordinator = group.is_coordinator();
    let val_loader = coordinator.then(|| {
        let val_set: Arc<dyn Dataset> =
            Arc::new(ImageDataset::open(data, SIZE, 1.0).expect("open"));
        DataLoader::new(val_set, 3, Sampler::Sequential, false, 1, 7).expect("val loader")
    });
    let outputs = coordinator.then(|| RunOutputs::create(log_dir).expect("outputs"));

    let mut training = TrainingLoop {
        tape,
        model,
        criterion: Box::new(NtXent::new(0.5)),
        optimizer,
        scheduler: Some(scheduler),
        train_loader,
        val_loader,
        group: Some(&group),
        outputs,
    };
    let history = training.run(EPOCHS).expect("run");
    let params = training
        .tape
        .params()
        .iter()
        .map(|p| p.data.clone())
        .collect();
    RankResult { history, params }
}

#[test]
fn data_parallel_run_checkpoints_only_on_rank_zero() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("train");
    write_images(&data, 8);
    let log_dir = root.path().join("runs").join("2024-01-01_00:00:00");

    let handles = LocalProcessGroup::group(WORLD)
        .into_iter()
        .map(|group| {
            let data = data.clone();
            let log_dir = log_dir.clone();
            thread::spawn(move || run_rank(group, &data, &log_dir))
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|h| h.join().expect("rank panicked"))
        .collect::<Vec<_>>();

    // replicas stay identical and report the same averaged loss
    assert_eq!(results[0].params, results[1].params);
    for (a, b) in results[0].history.iter().zip(&results[1].history) {
        assert_eq!(a.train_loss, b.train_loss);
        assert!(a.train_loss.is_finite());
    }
    assert!(results[0].history.iter().all(|s| s.val_loss.is_some()));
    assert!(results[1].history.iter().all(|s| s.val_loss.is_none()));

    let mut checkpoints = std::fs::read_dir(models_dir(&log_dir))
        .expect("models dir")
        .map(|e| e.expect("entry").file_name().into_string().expect("utf8"))
        .collect::<Vec<_>>();
    checkpoints.sort();
    assert_eq!(checkpoints, vec!["epoch_1.pth", "epoch_2.pth"]);

    let scalars = log_dir.join(SCALARS_FILE);
    let train = read_scalars(&scalars, "Loss/train").expect("scalars");
    assert_eq!(train.len(), EPOCHS);
    assert_eq!(train[1].1, results[0].history[1].train_loss);
    assert_eq!(read_scalars(&scalars, "Loss/validation").expect("scalars").len(), EPOCHS);

    let mut fresh = Tape::new();
    let (encoder, head) = build(&mut fresh, 1).into_parts();
    DualEncoderModel::load(&checkpoint_path(&log_dir, EPOCHS - 1), encoder, head, &mut fresh)
        .expect("load final checkpoint");
    let loaded = fresh
        .params()
        .iter()
        .map(|p| p.data.clone())
        .collect::<Vec<_>>();
    assert_eq!(loaded, results[0].params);
}

#[test]
fn failed_setup_on_one_rank_releases_the_others() {
    let root = tempfile::tempdir().expect("tempdir");
    let data = root.path().join("train");
    write_images(&data, 4);
    let missing = root.path().join("no_such_val");

    let handles = LocalProcessGroup::group(WORLD)
        .into_iter()
        .map(|group| {
            let data = data.clone();
            let missing = missing.clone();
            thread::spawn(move || {
                let rank = group.rank();
                let mut tape = Tape::new();
                let model = build(&mut tape, 3);
                if group.is_coordinator() {
                    let opened = ImageDataset::open(&missing, SIZE, 1.0);
                    assert!(opened.is_err());
                    group.abort();
                    return None;
                }
                let (optimizer, _) = build_optimizer(
                    &tape,
                    1,
                    &OptimizerConfig {
                        kind: OptimizerKind::Adam,
                        lr: 0.01,
                        weight_decay: 0.0,
                        momentum: 0.9,
                        nesterov: false,
                    },
                );
                let train_set: Arc<dyn Dataset> =
                    Arc::new(ImageDataset::open(&data, SIZE, 1.0).expect("open"));
                let sampler = DistributedSampler::new(train_set.len(), WORLD, rank, true, 7);
                let train_loader =
                    DataLoader::new(train_set, 2, Sampler::Distributed(sampler), true, 1, 7)
                        .expect("train loader");
                let mut training = TrainingLoop {
                    tape,
                    model,
                    criterion: Box::new(NtXent::new(0.5)),
                    optimizer,
                    scheduler: None,
                    train_loader,
                    val_loader: None,
                    group: Some(&group),
                    outputs: None,
                };
                Some(training.run(1))
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|h| h.join().expect("rank panicked"))
        .collect::<Vec<_>>();

    assert!(results[0].is_none());
    match &results[1] {
        Some(Err(TrainingError::Collective(CollectiveError::Aborted { rank: 0 }))) => {}
        other => panic!("expected the group abort, got {other:?}"),
    }
}
