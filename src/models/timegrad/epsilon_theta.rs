use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig1d};
use burn::tensor::activation;
use burn::tensor::{backend::Backend, Int, Tensor};

use crate::modules::activation::{silu, LeakyRelu, LeakyReluConfig};
use crate::utils::float_tensor;

/// Sinusoidal embedding of the diffusion step followed by a two layer MLP.
#[derive(Module, Debug)]
pub struct DiffusionEmbedding<B: Backend> {
    table: Vec<f32>,
    d_table: usize,
    projection1: Linear<B>,
    projection2: Linear<B>,
}

impl<B: Backend> DiffusionEmbedding<B> {
    pub fn forward(&self, steps: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let max_steps = self.table.len() / self.d_table;
        let table: Tensor<B, 2> =
            float_tensor::<B, 2>(self.table.clone(), [max_steps, self.d_table]).to_device(&steps.device());

        let x = table.select(0, steps);
        let x = silu(self.projection1.forward(x));
        silu(self.projection2.forward(x))
    }
}

fn embedding_table(max_steps: usize, dim: usize) -> Vec<f32> {
    let mut table = Vec::with_capacity(max_steps * dim * 2);
    for step in 0..max_steps {
        let angles: Vec<f32> = (0..dim)
            .map(|j| {
                let exponent = if dim > 1 { j as f32 * 4.0 / (dim - 1) as f32 } else { 0.0 };
                step as f32 * 10f32.powf(exponent)
            })
            .collect();
        table.extend(angles.iter().map(|a| a.sin()));
        table.extend(angles.iter().map(|a| a.cos()));
    }
    table
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    dilated_conv: Conv1d<B>,
    diffusion_projection: Linear<B>,
    conditioner_projection: Conv1d<B>,
    output_projection: Conv1d<B>,
    activation: LeakyRelu,
}

impl<B: Backend> ResidualBlock<B> {
    /// Returns the residual output and the skip connection, both
    /// `[N, C, L]`.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,           // [N, C, L]
        conditioner: Tensor<B, 3>, // [N, 1, D]
        diffusion_step: Tensor<B, 2>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let diffusion_step: Tensor<B, 3> = self
            .diffusion_projection
            .forward(diffusion_step)
            .unsqueeze_dim(2);
        let conditioner = self.conditioner_projection.forward(conditioner);

        let y = self.dilated_conv.forward(x.clone() + diffusion_step) + conditioner;
        let mut halves = y.chunk(2, 1);
        let filter = halves.remove(1);
        let gate = halves.remove(0);
        let y = activation::sigmoid(gate) * filter.tanh();

        let y = self.activation.forward(self.output_projection.forward(y));
        let mut halves = y.chunk(2, 1);
        let skip = halves.remove(1);
        let residual = halves.remove(0);

        ((x + residual) / 2f32.sqrt(), skip)
    }
}

/// Maps the projected encoder state onto the target dimension axis.
#[derive(Module, Debug)]
pub struct CondUpsampler<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
    activation: LeakyRelu,
}

impl<B: Backend> CondUpsampler<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.activation.forward(self.linear1.forward(x));
        self.activation.forward(self.linear2.forward(x))
    }
}

/// Noise prediction network of the diffusion head.
///
/// Inputs are `[N, 1, D]` noisy targets, `[N]` diffusion steps and
/// `[N, 1, cond_length]` conditioning vectors. The target dimension is the
/// convolution axis; the input projection pads it by two on each side and
/// the two final kernel-3 convolutions bring it back to `D`.
#[derive(Module, Debug)]
pub struct EpsilonTheta<B: Backend> {
    input_projection: Conv1d<B>,
    diffusion_embedding: DiffusionEmbedding<B>,
    cond_upsampler: CondUpsampler<B>,
    residual_layers: Vec<ResidualBlock<B>>,
    skip_projection: Conv1d<B>,
    output_projection: Conv1d<B>,
    activation: LeakyRelu,
}

impl<B: Backend> EpsilonTheta<B> {
    pub fn forward(
        &self,
        inputs: Tensor<B, 3>,
        time: Tensor<B, 1, Int>,
        cond: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let x = self.activation.forward(self.input_projection.forward(inputs));
        let diffusion_step = self.diffusion_embedding.forward(time);
        let cond_up = self.cond_upsampler.forward(cond);

        let mut x = x;
        let mut skips = Vec::with_capacity(self.residual_layers.len());
        for layer in self.residual_layers.iter() {
            let (next, skip) = layer.forward(x, cond_up.clone(), diffusion_step.clone());
            x = next;
            skips.push(skip);
        }

        let num_skips = skips.len() as f32;
        let skip = skips
            .into_iter()
            .reduce(|acc, s| acc + s)
            .map(|sum| sum / num_skips.sqrt())
            .unwrap_or(x);

        let x = self.activation.forward(self.skip_projection.forward(skip));
        self.output_projection.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct EpsilonThetaConfig {
    target_dim: usize,
    cond_length: usize,
    max_steps: usize,

    #[config(default = 16)]
    time_emb_dim: usize,

    #[config(default = 8)]
    residual_layers: usize,

    #[config(default = 8)]
    residual_channels: usize,

    #[config(default = 2)]
    dilation_cycle_length: usize,

    #[config(default = 64)]
    residual_hidden: usize,
}

impl EpsilonThetaConfig {
    pub fn init<B: Backend>(&self) -> EpsilonTheta<B> {
        let channels = self.residual_channels;
        let leaky = LeakyReluConfig::new().init();

        let diffusion_embedding = DiffusionEmbedding {
            table: embedding_table(self.max_steps, self.time_emb_dim),
            d_table: 2 * self.time_emb_dim,
            projection1: LinearConfig::new(2 * self.time_emb_dim, self.residual_hidden).init(),
            projection2: LinearConfig::new(self.residual_hidden, self.residual_hidden).init(),
        };

        let d_upsample = (self.target_dim / 2).max(1);
        let cond_upsampler = CondUpsampler {
            linear1: LinearConfig::new(self.cond_length, d_upsample).init(),
            linear2: LinearConfig::new(d_upsample, self.target_dim).init(),
            activation: leaky.clone(),
        };

        let residual_layers = (0..self.residual_layers)
            .map(|i| {
                let dilation = 1 << (i % self.dilation_cycle_length.max(1));
                ResidualBlock {
                    dilated_conv: Conv1dConfig::new(channels, 2 * channels, 3)
                        .with_dilation(dilation)
                        .with_padding(PaddingConfig1d::Explicit(dilation))
                        .init(),
                    diffusion_projection: LinearConfig::new(self.residual_hidden, channels).init(),
                    conditioner_projection: Conv1dConfig::new(1, 2 * channels, 1)
                        .with_padding(PaddingConfig1d::Explicit(2))
                        .init(),
                    output_projection: Conv1dConfig::new(channels, 2 * channels, 1).init(),
                    activation: leaky.clone(),
                }
            })
            .collect();

        EpsilonTheta {
            input_projection: Conv1dConfig::new(1, channels, 1)
                .with_padding(PaddingConfig1d::Explicit(2))
                .init(),
            diffusion_embedding,
            cond_upsampler,
            residual_layers,
            skip_projection: Conv1dConfig::new(channels, channels, 3).init(),
            output_projection: Conv1dConfig::new(channels, 1, 3).init(),
            activation: leaky,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::int_tensor;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn predicts_noise_with_input_shape() {
        let net: EpsilonTheta<TestBackend> = EpsilonThetaConfig::new(5, 12, 10)
            .with_residual_layers(3)
            .init();

        let out = net.forward(
            Tensor::ones([4, 1, 5]),
            int_tensor(vec![0, 3, 9, 5], [4]),
            Tensor::ones([4, 1, 12]),
        );

        assert_eq!(out.dims(), [4, 1, 5]);
    }

    #[test]
    fn embedding_table_starts_with_sin_zero_cos_one() {
        let table = embedding_table(3, 4);

        assert_eq!(table.len(), 3 * 8);
        assert_eq!(&table[..8], &[0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
    }
}
