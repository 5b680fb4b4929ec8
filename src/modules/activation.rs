use burn::config::Config;
use burn::module::Module;
use burn::tensor::activation;
use burn::tensor::{backend::Backend, Tensor};

#[derive(Module, Debug, Clone)]
pub struct LeakyRelu {
    negative_slope: f32,
}

impl LeakyRelu {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let mask = x.clone().lower_elem(0.0);
        let value = x.clone() * self.negative_slope;

        x.mask_where(mask, value)
    }
}

#[derive(Config, Debug)]
pub struct LeakyReluConfig {
    #[config(default = 0.4)]
    negative_slope: f32,
}

impl LeakyReluConfig {
    pub fn init(&self) -> LeakyRelu {
        LeakyRelu {
            negative_slope: self.negative_slope,
        }
    }
}

/// `x * sigmoid(x)`
pub fn silu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * activation::sigmoid(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{float_tensor, to_vec};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn leaky_relu_scales_negatives() {
        let x = float_tensor::<TestBackend, 1>(vec![-2.0, 0.0, 3.0], [3]);
        let y = LeakyReluConfig::new().with_negative_slope(0.5).init().forward(x);

        assert_eq!(to_vec(y), vec![-1.0, 0.0, 3.0]);
    }

    #[test]
    fn silu_at_zero_is_zero() {
        let x = float_tensor::<TestBackend, 1>(vec![0.0], [1]);

        assert_eq!(to_vec(silu(x)), vec![0.0]);
    }
}
