use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use image::{imageops::FilterType, RgbImage};
use rayon::prelude::*;
use thiserror::Error;

use crate::autograd::Rng;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Error)]
pub enum DataError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoding {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("no images found in {0}")]
    Empty(PathBuf),
    #[error("index {index} out of range for dataset of {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("building loader pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Two augmented views of one underlying sample, flattened CHW.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewPair {
    pub first: Vec<f32>,
    pub second: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewBatch {
    pub first: Vec<Vec<f32>>,
    pub second: Vec<Vec<f32>>,
}

impl ViewBatch {
    #[cfg(test)]
    fn len(&self) -> usize {
        self.first.len()
    }
}

impl FromIterator<ViewPair> for ViewBatch {
    fn from_iter<I: IntoIterator<Item = ViewPair>>(iter: I) -> Self {
        let (first, second) = iter.into_iter().map(|p| (p.first, p.second)).unzip();
        Self { first, second }
    }
}

pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produces both views of sample `index`; all randomness comes from `rng`.
    fn get(&self, index: usize, rng: &mut Rng) -> Result<ViewPair, DataError>;
}

/// SimCLR-style view generator: random resized crop, horizontal flip,
/// colour jitter and random grayscale.
#[derive(Debug, Clone, Copy)]
pub struct Augmentation {
    size: u32,
    jitter: f32,
}

impl Augmentation {
    pub fn new(size: u32, jitter: f32) -> Self {
        Self { size, jitter }
    }

    pub fn view(&self, image: &RgbImage, rng: &mut Rng) -> Vec<f32> {
        let cropped = random_resized_crop(image, rng);
        let mut resized =
            image::imageops::resize(&cropped, self.size, self.size, FilterType::Triangle);
        if rng.bernoulli(0.5) {
            image::imageops::flip_horizontal_in_place(&mut resized);
        }

        let mut pixels = resized
            .pixels()
            .map(|p| p.0.map(|c| f32::from(c) / 255.0))
            .collect::<Vec<_>>();
        if rng.bernoulli(0.8) {
            color_jitter(&mut pixels, 0.8 * self.jitter, rng);
        }
        if rng.bernoulli(0.2) {
            for px in &mut pixels {
                *px = [luma(*px); 3];
            }
        }

        let plane = pixels.len();
        let mut chw = vec![0.0; 3 * plane];
        for (i, px) in pixels.iter().enumerate() {
            for (c, value) in px.iter().enumerate() {
                chw[c * plane + i] = *value;
            }
        }
        chw
    }
}

fn random_resized_crop(image: &RgbImage, rng: &mut Rng) -> RgbImage {
    let (width, height) = image.dimensions();
    let area = f64::from(width) * f64::from(height);
    let (log_low, log_high) = ((3.0_f64 / 4.0).ln(), (4.0_f64 / 3.0).ln());

    for _ in 0..10 {
        let target_area = area * rng.uniform(0.08, 1.0);
        let aspect = rng.uniform(log_low, log_high).exp();
        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.below((width - w + 1) as usize) as u32;
            let y = rng.below((height - h + 1) as usize) as u32;
            return image::imageops::crop_imm(image, x, y, w, h).to_image();
        }
    }

    let side = width.min(height);
    let (x, y) = ((width - side) / 2, (height - side) / 2);
    image::imageops::crop_imm(image, x, y, side, side).to_image()
}

fn luma(px: [f32; 3]) -> f32 {
    0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2]
}

fn color_jitter(pixels: &mut [[f32; 3]], strength: f32, rng: &mut Rng) {
    if strength <= 0.0 || pixels.is_empty() {
        return;
    }
    let (low, high) = (f64::from((1.0 - strength).max(0.0)), f64::from(1.0 + strength));
    let mut factor = || rng.uniform(low, high) as f32;
    let brightness = factor();
    let contrast = factor();
    let saturation = factor();

    let mut order = [0_u8, 1, 2];
    rng.shuffle(&mut order);
    for op in order {
        match op {
            0 => {
                for px in pixels.iter_mut() {
                    *px = px.map(|c| (c * brightness).clamp(0.0, 1.0));
                }
            }
            1 => {
                let mean = pixels.iter().map(|px| luma(*px)).sum::<f32>() / pixels.len() as f32;
                for px in pixels.iter_mut() {
                    *px = px.map(|c| ((c - mean) * contrast + mean).clamp(0.0, 1.0));
                }
            }
            _ => {
                for px in pixels.iter_mut() {
                    let gray = luma(*px);
                    *px = px.map(|c| ((c - gray) * saturation + gray).clamp(0.0, 1.0));
                }
            }
        }
    }
}

/// Every png/jpeg file directly inside a directory, in name order.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    files: Vec<PathBuf>,
    augmentation: Augmentation,
}

impl ImageDataset {
    pub fn open(dir: &Path, size: u32, jitter: f32) -> Result<Self, DataError> {
        let io_err = |source| DataError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(DataError::Empty(dir.to_path_buf()));
        }
        files.sort();

        Ok(Self {
            files,
            augmentation: Augmentation::new(size, jitter),
        })
    }
}

impl Dataset for ImageDataset {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize, rng: &mut Rng) -> Result<ViewPair, DataError> {
        let path = self.files.get(index).ok_or(DataError::OutOfRange {
            index,
            len: self.files.len(),
        })?;
        let image = image::open(path)
            .map_err(|source| DataError::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8();
        Ok(ViewPair {
            first: self.augmentation.view(&image, rng),
            second: self.augmentation.view(&image, rng),
        })
    }
}

/// Pre-flattened samples; views are the sample plus gaussian noise.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    samples: Vec<Vec<f32>>,
    noise: f64,
}

impl TensorDataset {
    pub fn new(samples: Vec<Vec<f32>>, noise: f64) -> Self {
        Self { samples, noise }
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize, rng: &mut Rng) -> Result<ViewPair, DataError> {
        let sample = self.samples.get(index).ok_or(DataError::OutOfRange {
            index,
            len: self.samples.len(),
        })?;
        let mut view = || {
            sample
                .iter()
                .map(|v| v + rng.gauss(0.0, self.noise) as f32)
                .collect::<Vec<_>>()
        };
        let first = view();
        let second = view();
        Ok(ViewPair { first, second })
    }
}

/// Partitions a dataset across replicas, re-shuffling per epoch.
///
/// Indices are padded by wrapping around so every replica sees the same
/// number of samples.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(len: usize, num_replicas: usize, rank: usize, shuffle: bool, seed: u64) -> Self {
        assert!(num_replicas > 0, "num_replicas must be > 0");
        assert!(rank < num_replicas, "rank {rank} out of range for {num_replicas} replicas");
        Self {
            len,
            num_replicas,
            rank,
            shuffle,
            seed,
            epoch: 0,
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch as u64;
    }

    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.num_replicas)
    }

    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut all = (0..self.len).collect::<Vec<_>>();
        if self.shuffle {
            Rng::new(self.seed.wrapping_add(self.epoch)).shuffle(&mut all);
        }
        let total = self.num_samples() * self.num_replicas;
        let mut padded = all.clone();
        while padded.len() < total {
            let missing = total - padded.len();
            padded.extend(all.iter().take(missing));
        }
        padded
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum Sampler {
    Sequential,
    /// New permutation every pass.
    Random { seed: u64 },
    Distributed(DistributedSampler),
}

impl Sampler {
    fn len(&self, dataset_len: usize) -> usize {
        match self {
            Sampler::Distributed(sampler) => sampler.num_samples(),
            _ => dataset_len,
        }
    }

    fn indices(&self, dataset_len: usize, pass: u64) -> Vec<usize> {
        match self {
            Sampler::Sequential => (0..dataset_len).collect(),
            Sampler::Random { seed } => {
                let mut all = (0..dataset_len).collect::<Vec<_>>();
                Rng::derive(*seed, &[pass]).shuffle(&mut all);
                all
            }
            Sampler::Distributed(sampler) => sampler.indices(),
        }
    }
}

pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    drop_last: bool,
    sampler: Sampler,
    pool: rayon::ThreadPool,
    seed: u64,
    pass: u64,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        batch_size: usize,
        sampler: Sampler,
        drop_last: bool,
        workers: usize,
        seed: u64,
    ) -> Result<Self, DataError> {
        assert!(batch_size > 0, "batch_size must be > 0");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("loader-{i}"))
            .build()?;
        Ok(Self {
            dataset,
            batch_size,
            drop_last,
            sampler,
            pool,
            seed,
            pass: 0,
        })
    }

    /// Forwards the epoch to a distributed sampler so its shuffle changes.
    pub fn set_epoch(&mut self, epoch: usize) {
        if let Sampler::Distributed(sampler) = &mut self.sampler {
            sampler.set_epoch(epoch);
        }
    }

    pub fn num_batches(&self) -> usize {
        let len = self.sampler.len(self.dataset.len());
        if self.drop_last {
            len / self.batch_size
        } else {
            len.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_batches() == 0
    }

    /// One pass over the data. Each call advances the augmentation stream.
    pub fn iter(&mut self) -> Batches<'_> {
        let pass = self.pass;
        self.pass += 1;
        let mut indices = self.sampler.indices(self.dataset.len(), pass);
        indices.truncate(self.num_batches() * self.batch_size);
        Batches {
            loader: self,
            indices,
            cursor: 0,
            pass,
        }
    }

    fn load(&self, indices: &[usize], pass: u64) -> Result<ViewBatch, DataError> {
        let dataset = &self.dataset;
        let seed = self.seed;
        self.pool.install(|| {
            indices
                .par_iter()
                .map(|index| {
                    let mut rng = Rng::derive(seed, &[pass, *index as u64]);
                    dataset.get(*index, &mut rng)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .map(|pairs| pairs.into_iter().collect())
    }
}

pub struct Batches<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    cursor: usize,
    pass: u64,
}

impl Iterator for Batches<'_> {
    type Item = Result<ViewBatch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.indices.len());
        let batch = self.loader.load(&self.indices[self.cursor..end], self.pass);
        self.cursor = end;
        Some(batch)
    }
}
