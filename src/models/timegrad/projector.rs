use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{backend::Backend, Tensor};

/// Projects encoder outputs `[N, S, H]` to the conditioning vectors
/// `[N, S, cond_length]` of the diffusion head.
#[derive(Module, Debug)]
pub struct ArgsProjector<B: Backend> {
    proj: Linear<B>,
    cond_length: usize,
}

impl<B: Backend> ArgsProjector<B> {
    pub fn cond_length(&self) -> usize {
        self.cond_length
    }

    pub fn forward(&self, rnn_outputs: Tensor<B, 3>) -> Tensor<B, 3> {
        self.proj.forward(rnn_outputs)
    }
}

#[derive(Config, Debug)]
pub struct DiffusionOutputConfig {
    cond_length: usize,
}

impl DiffusionOutputConfig {
    pub fn args_proj<B: Backend>(&self, d_hidden: usize) -> ArgsProjector<B> {
        ArgsProjector {
            proj: LinearConfig::new(d_hidden, self.cond_length).init(),
            cond_length: self.cond_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn projects_hidden_states_to_condition() {
        let proj = DiffusionOutputConfig::new(7).args_proj::<NdArray<f32>>(10);

        assert_eq!(proj.forward(Tensor::ones([2, 5, 10])).dims(), [2, 5, 7]);
    }
}
