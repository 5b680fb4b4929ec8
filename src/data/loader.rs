use std::sync::Arc;

use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::{Dataset, InMemDataset};
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::batcher::TimeGradBatcher;
use super::batchitem::TimeGradBatch;
use super::transform::TimeSeriesEntry;
use super::window::{slice_window, InstanceSampler, Window};
use crate::error::ForecastError;

/// Hands out one burn data loader per pass over the data.
pub trait BatchSource: Send {
    type TrainBatch;
    type ValidBatch;

    /// Batches of the next pass on the autodiff backend.
    fn train_pass(&mut self) -> Arc<dyn DataLoader<Self::TrainBatch>>;

    /// Batches of the next pass for gradient-free evaluation.
    fn valid_pass(&mut self) -> Arc<dyn DataLoader<Self::ValidBatch>>;

    /// A loader yielding nothing, for runs without validation data.
    fn no_valid(&self) -> Arc<dyn DataLoader<Self::ValidBatch>>;
}

/// Seed of a loader worker; distinct workers never share a stream.
pub fn worker_seed(base: u64, worker_id: usize) -> u64 {
    base.wrapping_add(worker_id as u64)
}

#[derive(Config, Debug)]
pub struct WindowLoaderConfig {
    #[config(default = 64)]
    pub batch_size: usize,

    #[config(default = 50)]
    pub num_batches_per_epoch: usize,

    #[config(default = 1)]
    pub num_workers: usize,

    /// Minimum observed steps before a training pivot.
    #[config(default = 1)]
    pub min_past: usize,

    #[config(default = 0)]
    pub seed: u64,
}

/// Cuts windows out of transformed series and batches them.
///
/// Training loaders draw `num_batches_per_epoch` batches of random windows per
/// pass, split across rayon workers. Validation loaders emit the last window
/// of every series in dataset order.
pub struct WindowLoader<B: AutodiffBackend> {
    dataset: Arc<dyn Dataset<TimeSeriesEntry>>,
    batcher: TimeGradBatcher<B>,
    valid_batcher: TimeGradBatcher<B::InnerBackend>,
    sampler: InstanceSampler,
    history_length: usize,
    prediction_length: usize,
    batch_size: usize,
    num_batches_per_epoch: Option<usize>,
    num_workers: usize,
    shuffle_buffer_length: Option<usize>,
    rng: StdRng,
}

impl<B: AutodiffBackend> WindowLoader<B> {
    pub fn training(
        dataset: Arc<dyn Dataset<TimeSeriesEntry>>,
        device: B::Device,
        history_length: usize,
        prediction_length: usize,
        config: &WindowLoaderConfig,
        shuffle_buffer_length: Option<usize>,
    ) -> crate::error::Result<Self> {
        let sampler = InstanceSampler::Train {
            min_past: config.min_past,
        };
        Self::ensure_instances(dataset.as_ref(), sampler, prediction_length)?;

        Ok(Self {
            dataset,
            batcher: TimeGradBatcher::new(device.clone()),
            valid_batcher: TimeGradBatcher::new(device),
            sampler,
            history_length,
            prediction_length,
            batch_size: config.batch_size.max(1),
            num_batches_per_epoch: Some(config.num_batches_per_epoch),
            num_workers: config.num_workers.max(1),
            shuffle_buffer_length,
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    pub fn validation(
        dataset: Arc<dyn Dataset<TimeSeriesEntry>>,
        device: B::Device,
        history_length: usize,
        prediction_length: usize,
        config: &WindowLoaderConfig,
    ) -> crate::error::Result<Self> {
        let sampler = InstanceSampler::Validation;
        Self::ensure_instances(dataset.as_ref(), sampler, prediction_length)?;

        Ok(Self {
            dataset,
            batcher: TimeGradBatcher::new(device.clone()),
            valid_batcher: TimeGradBatcher::new(device),
            sampler,
            history_length,
            prediction_length,
            batch_size: config.batch_size.max(1),
            num_batches_per_epoch: None,
            num_workers: 1,
            shuffle_buffer_length: None,
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    fn ensure_instances(
        dataset: &dyn Dataset<TimeSeriesEntry>,
        sampler: InstanceSampler,
        prediction_length: usize,
    ) -> crate::error::Result<()> {
        let found = (0..dataset.len())
            .filter_map(|index| dataset.get(index))
            .any(|entry| sampler.candidates(entry.length, prediction_length).is_some());

        if found {
            Ok(())
        } else {
            Err(ForecastError::NoInstances {
                num_entries: dataset.len(),
            })
        }
    }

    fn sampled_windows(&mut self, total: usize) -> Vec<Window> {
        let base: u64 = self.rng.gen();
        let workers = self.num_workers;
        let quotas: Vec<usize> = (0..workers)
            .map(|w| total / workers + usize::from(w < total % workers))
            .collect();

        let dataset = &self.dataset;
        let sampler = self.sampler;
        let (history, prediction) = (self.history_length, self.prediction_length);

        let per_worker: Vec<Vec<Window>> = quotas
            .into_par_iter()
            .enumerate()
            .map(|(worker_id, quota)| {
                let mut rng = StdRng::seed_from_u64(worker_seed(base, worker_id));
                let mut windows = Vec::with_capacity(quota);
                let mut misses = 0;

                while windows.len() < quota && misses < 100 + 10 * quota {
                    let index = rng.gen_range(0..dataset.len());
                    let window = dataset.get(index).and_then(|entry| {
                        sampler
                            .sample(entry.length, prediction, &mut rng)
                            .map(|pivot| slice_window(&entry, pivot, history, prediction))
                    });
                    match window {
                        Some(window) => windows.push(window),
                        None => misses += 1,
                    }
                }

                tracing::debug!("worker {} produced {} windows", worker_id, windows.len());
                windows
            })
            .collect();

        let windows: Vec<Window> = per_worker.into_iter().flatten().collect();
        match self.shuffle_buffer_length {
            Some(length) if length > 1 => shuffle_with_buffer(windows, length, &mut self.rng),
            _ => windows,
        }
    }

    /// Windows of the next pass, in batch order.
    pub fn windows(&mut self) -> Vec<Window> {
        match self.num_batches_per_epoch {
            Some(num_batches) => self.sampled_windows(num_batches * self.batch_size),
            None => self.ordered_windows(),
        }
    }

    fn ordered_windows(&mut self) -> Vec<Window> {
        let mut windows = Vec::with_capacity(self.dataset.len());
        for entry in (0..self.dataset.len()).filter_map(|index| self.dataset.get(index)) {
            if let Some(pivot) = self
                .sampler
                .sample(entry.length, self.prediction_length, &mut self.rng)
            {
                windows.push(slice_window(
                    &entry,
                    pivot,
                    self.history_length,
                    self.prediction_length,
                ));
            }
        }
        windows
    }
}

/// Streams windows through a fixed-size buffer, emitting a random buffered
/// element once it is full.
fn shuffle_with_buffer<T, R: Rng>(items: Vec<T>, buffer_length: usize, rng: &mut R) -> Vec<T> {
    let mut buffer = Vec::with_capacity(buffer_length);
    let mut out = Vec::with_capacity(items.len());

    for item in items {
        buffer.push(item);
        if buffer.len() >= buffer_length {
            let index = rng.gen_range(0..buffer.len());
            out.push(buffer.swap_remove(index));
        }
    }
    while !buffer.is_empty() {
        let index = rng.gen_range(0..buffer.len());
        out.push(buffer.swap_remove(index));
    }

    out
}

impl<B: AutodiffBackend> BatchSource for WindowLoader<B> {
    type TrainBatch = TimeGradBatch<B>;
    type ValidBatch = TimeGradBatch<B::InnerBackend>;

    fn train_pass(&mut self) -> Arc<dyn DataLoader<TimeGradBatch<B>>> {
        let windows = self.windows();
        DataLoaderBuilder::new(self.batcher.clone())
            .batch_size(self.batch_size)
            .build(InMemDataset::new(windows))
    }

    fn valid_pass(&mut self) -> Arc<dyn DataLoader<TimeGradBatch<B::InnerBackend>>> {
        let windows = self.windows();
        DataLoaderBuilder::new(self.valid_batcher.clone())
            .batch_size(self.batch_size)
            .build(InMemDataset::new(windows))
    }

    fn no_valid(&self) -> Arc<dyn DataLoader<TimeGradBatch<B::InnerBackend>>> {
        DataLoaderBuilder::new(self.valid_batcher.clone())
            .batch_size(self.batch_size)
            .build(InMemDataset::new(Vec::<Window>::new()))
    }
}
