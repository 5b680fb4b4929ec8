use burn::data::dataloader::batcher::Batcher;
use burn::tensor::backend::Backend;
use burn::tensor::{Data, Int, Shape, Tensor};

use super::batchitem::TimeGradBatch;
use super::window::Window;

#[derive(Clone, Debug)]
pub struct TimeGradBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> TimeGradBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    fn stack<const D: usize>(&self, values: Vec<f32>, dims: [usize; D]) -> Tensor<B, D> {
        let data = Data::new(values, Shape::new(dims));
        Tensor::from_data(data.convert()).to_device(&self.device)
    }
}

impl<B: Backend> Batcher<Window, TimeGradBatch<B>> for TimeGradBatcher<B> {
    fn batch(&self, items: Vec<Window>) -> TimeGradBatch<B> {
        let batch_size = items.len();
        let (dim, feat, history, prediction) = match items.first() {
            Some(first) => (
                first.target_dim,
                first.num_time_feat,
                first.history_length(),
                first.prediction_length(),
            ),
            None => (0, 0, 0, 0),
        };

        let gather = |field: fn(&Window) -> &Vec<f32>| -> Vec<f32> {
            items.iter().flat_map(|w| field(w).iter().copied()).collect()
        };

        let indicator: Vec<i64> = (0..batch_size)
            .flat_map(|_| (0..dim as i64))
            .collect();
        let indicator = Data::new(indicator, Shape::new([batch_size, dim]));
        let target_dimension_indicator: Tensor<B, 2, Int> =
            Tensor::from_data(indicator.convert()).to_device(&self.device);

        TimeGradBatch {
            target_dimension_indicator,
            past_target: self.stack(gather(|w| &w.past_target), [batch_size, history, dim]),
            past_observed_values: self.stack(
                gather(|w| &w.past_observed),
                [batch_size, history, dim],
            ),
            past_is_pad: self.stack(gather(|w| &w.past_is_pad), [batch_size, history]),
            past_time_feat: self.stack(
                gather(|w| &w.past_time_feat),
                [batch_size, history, feat],
            ),
            future_time_feat: self.stack(
                gather(|w| &w.future_time_feat),
                [batch_size, prediction, feat],
            ),
            future_target: self.stack(
                gather(|w| &w.future_target),
                [batch_size, prediction, dim],
            ),
            future_observed_values: self.stack(
                gather(|w| &w.future_observed),
                [batch_size, prediction, dim],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::transform::TimeSeriesEntry;
    use crate::data::window::slice_window;
    use crate::utils::to_vec;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn stacks_windows_along_batch() {
        let entry = TimeSeriesEntry {
            item_id: "a".to_string(),
            target: (0..12).map(|v| v as f32).collect(),
            observed: vec![1.0; 12],
            time_feat: vec![0.5; 8],
            length: 4,
            target_dim: 3,
            num_time_feat: 1,
        };
        let windows = vec![slice_window(&entry, 2, 3, 2), slice_window(&entry, 1, 3, 2)];

        let batch: TimeGradBatch<TestBackend> = TimeGradBatcher::new(Default::default()).batch(windows);

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.past_target.dims(), [2, 3, 3]);
        assert_eq!(batch.past_is_pad.dims(), [2, 3]);
        assert_eq!(batch.past_time_feat.dims(), [2, 3, 1]);
        assert_eq!(batch.future_target.dims(), [2, 2, 3]);
        assert_eq!(batch.target_dimension_indicator.dims(), [2, 3]);
        assert_eq!(to_vec(batch.past_is_pad), vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0]);
    }
}
