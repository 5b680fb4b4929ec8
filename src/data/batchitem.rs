use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

#[derive(Clone, Debug)]
pub struct TimeGradBatch<B: Backend> {
    pub target_dimension_indicator: Tensor<B, 2, Int>, // [N, D]
    pub past_target: Tensor<B, 3>,                     // [N, H, D]
    pub past_observed_values: Tensor<B, 3>,            // [N, H, D]
    pub past_is_pad: Tensor<B, 2>,                     // [N, H]
    pub past_time_feat: Tensor<B, 3>,                  // [N, H, F]
    pub future_time_feat: Tensor<B, 3>,                // [N, P, F]
    pub future_target: Tensor<B, 3>,                   // [N, P, D], zeros at inference
    pub future_observed_values: Tensor<B, 3>,          // [N, P, D]
}

impl<B: Backend> TimeGradBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.past_target.dims()[0]
    }
}
