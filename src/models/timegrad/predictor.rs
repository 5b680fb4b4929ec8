use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;

use crate::data::batcher::TimeGradBatcher;
use crate::data::item::MultivariateItem;
use crate::data::transform::{TimeGradTransformation, Transformation};
use crate::data::window::{slice_window, InstanceSampler, Window};
use crate::error::Result;
use crate::utils::to_vec;

use super::model::TimeGradModel;

/// Sample paths drawn for one series, laid out `[sample, step, dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleForecast {
    pub item_id: String,
    pub samples: Vec<f32>,
    pub num_samples: usize,
    pub prediction_length: usize,
    pub target_dim: usize,
}

impl SampleForecast {
    fn step_values(&self, index: usize) -> Vec<f32> {
        let stride = self.prediction_length * self.target_dim;
        (0..self.num_samples)
            .map(|s| self.samples[s * stride + index])
            .collect()
    }

    /// One sample path, `[step, dim]`.
    pub fn sample(&self, index: usize) -> &[f32] {
        let stride = self.prediction_length * self.target_dim;
        &self.samples[index * stride..(index + 1) * stride]
    }

    /// Mean over samples, `[step, dim]`.
    pub fn mean(&self) -> Vec<f32> {
        (0..self.prediction_length * self.target_dim)
            .map(|i| self.step_values(i).iter().sum::<f32>() / self.num_samples as f32)
            .collect()
    }

    /// Empirical quantile over samples, `[step, dim]`.
    pub fn quantile(&self, q: f32) -> Vec<f32> {
        assert!((0.0..=1.0).contains(&q), "quantile {q} outside [0, 1]");

        (0..self.prediction_length * self.target_dim)
            .map(|i| {
                let mut values = self.step_values(i);
                values.sort_by(|a, b| a.total_cmp(b));
                let rank = (q * (values.len() - 1) as f32).round() as usize;
                values[rank]
            })
            .collect()
    }
}

/// A trained network together with the transformation it was trained with.
#[derive(Debug, Clone)]
pub struct TimeGradPredictor<B: AutodiffBackend> {
    transformation: TimeGradTransformation,
    network: TimeGradModel<B>,
    batcher: TimeGradBatcher<B::InnerBackend>,
    batch_size: usize,
}

impl<B: AutodiffBackend> TimeGradPredictor<B> {
    pub fn new(
        transformation: TimeGradTransformation,
        network: TimeGradModel<B>,
        device: B::Device,
        batch_size: usize,
    ) -> Self {
        Self {
            transformation,
            network,
            batcher: TimeGradBatcher::new(device),
            batch_size: batch_size.max(1),
        }
    }

    pub fn network(&self) -> &TimeGradModel<B> {
        &self.network
    }

    pub fn transformation(&self) -> &TimeGradTransformation {
        &self.transformation
    }

    pub fn prediction_length(&self) -> usize {
        self.network.prediction_length()
    }

    /// Forecasts the continuation of every series in `dataset`.
    ///
    /// Series too short to hold a single observation are skipped.
    pub fn predict<D: Dataset<MultivariateItem>>(&self, dataset: &D) -> Result<Vec<SampleForecast>> {
        let items: Vec<MultivariateItem> = (0..dataset.len())
            .filter_map(|index| dataset.get(index))
            .collect();
        for item in items.iter() {
            self.transformation.check_entry(item)?;
        }

        let model = self.network.valid();
        let history = model.history_length();
        let prediction = model.prediction_length();
        let samples = model.num_parallel_samples();

        let windows: Vec<Window> = items
            .iter()
            .filter_map(|item| {
                let entry = self.transformation.map_entry(item, false);
                match InstanceSampler::Test.candidates(entry.length, prediction) {
                    Some(pivots) => Some(slice_window(&entry, *pivots.end(), history, prediction)),
                    None => {
                        tracing::warn!("skipping empty series `{}`", entry.item_id);
                        None
                    }
                }
            })
            .collect();

        let mut forecasts = Vec::with_capacity(windows.len());
        for chunk in windows.chunks(self.batch_size) {
            let item_ids: Vec<String> = chunk.iter().map(|w| w.item_id.clone()).collect();
            let target_dim = chunk[0].target_dim;
            let batch = self.batcher.batch(chunk.to_vec());
            let paths = to_vec(model.forward(batch));

            let stride = samples * prediction * target_dim;
            for (i, item_id) in item_ids.into_iter().enumerate() {
                forecasts.push(SampleForecast {
                    item_id,
                    samples: paths[i * stride..(i + 1) * stride].to_vec(),
                    num_samples: samples,
                    prediction_length: prediction,
                    target_dim,
                });
            }
        }
        tracing::debug!("produced {} forecasts", forecasts.len());

        Ok(forecasts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecast() -> SampleForecast {
        // three samples, two steps, one dimension
        SampleForecast {
            item_id: "a".to_string(),
            samples: vec![1.0, 10.0, 3.0, 30.0, 2.0, 20.0],
            num_samples: 3,
            prediction_length: 2,
            target_dim: 1,
        }
    }

    #[test]
    fn summary_statistics_over_samples() {
        let forecast = forecast();

        assert_eq!(forecast.mean(), vec![2.0, 20.0]);
        assert_eq!(forecast.quantile(0.5), vec![2.0, 20.0]);
        assert_eq!(forecast.quantile(0.0), vec![1.0, 10.0]);
        assert_eq!(forecast.quantile(1.0), vec![3.0, 30.0]);
        assert_eq!(forecast.sample(1), &[3.0, 30.0]);
    }
}
