use std::path::Path;

use burn::config::Config;
use burn::module::Module;
use burn::record::CompactRecorder;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor};
use burn::train::{RegressionOutput, TrainOutput, TrainStep, ValidStep};
use serde::Serialize;

use crate::data::batchitem::TimeGradBatch;
use crate::error::ForecastError;
use crate::estimator::callbacks::Checkpointable;
use crate::modules::rnn::{CellType, RecurrentState};
use crate::utils::{repeat_interleave, weighted_average};

use super::diffusion::{BetaSchedule, GaussianDiffusion, GaussianDiffusionConfig, LossType};
use super::encoder::{effective_observed, SequenceEncoder, SequenceEncoderConfig, TeacherForcing};
use super::epsilon_theta::EpsilonThetaConfig;
use super::lags::lagged_subsequences;
use super::projector::{ArgsProjector, DiffusionOutputConfig};
use super::scaler::{ScaleParams, ScalerConfig};

pub struct LossOutput<B: Backend> {
    pub loss: Tensor<B, 1>,        // scalar
    pub likelihoods: Tensor<B, 3>, // [N, C + P, 1]
    pub loss_weights: Tensor<B, 3>, // [N, C + P, 1]
    pub distr_args: Tensor<B, 3>,  // [N, C + P, cond_length]
}

/// Architecture of a [`TimeGradModel`]; two networks with equal signatures
/// share a record layout.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ModelSignature {
    pub target_dim: usize,
    pub context_length: usize,
    pub prediction_length: usize,
    pub lags_seq: Vec<usize>,
    pub cell_type: CellType,
    pub num_layers: usize,
    pub num_cells: usize,
    pub cond_length: usize,
    pub diff_steps: usize,
}

#[derive(Module, Debug)]
pub struct TimeGradModel<B: Backend> {
    encoder: SequenceEncoder<B>,
    proj_dist_args: ArgsProjector<B>,
    diffusion: GaussianDiffusion<B>,
    target_dim: usize,
    context_length: usize,
    prediction_length: usize,
    num_parallel_samples: usize,
}

impl<B: Backend> TimeGradModel<B> {
    pub fn history_length(&self) -> usize {
        self.encoder.history_length()
    }

    pub fn prediction_length(&self) -> usize {
        self.prediction_length
    }

    pub fn num_parallel_samples(&self) -> usize {
        self.num_parallel_samples
    }

    pub fn signature(&self) -> ModelSignature {
        ModelSignature {
            target_dim: self.target_dim,
            context_length: self.context_length,
            prediction_length: self.prediction_length,
            lags_seq: self.encoder.lags().to_vec(),
            cell_type: self.encoder.rnn().cell_type(),
            num_layers: self.encoder.rnn().num_layers(),
            num_cells: self.encoder.rnn().d_hidden(),
            cond_length: self.proj_dist_args.cond_length(),
            diff_steps: self.diffusion.num_steps(),
        }
    }

    pub fn distr_args(&self, rnn_outputs: Tensor<B, 3>) -> Tensor<B, 3> {
        self.proj_dist_args.forward(rnn_outputs)
    }

    /// Teacher-forced pass over the context and prediction range.
    pub fn loss(&self, batch: TimeGradBatch<B>) -> LossOutput<B> {
        let [n, history, dim] = batch.past_target.dims();
        let context = history - self.context_length..history;

        let encoded = self.encoder.unroll_encoder(
            batch.past_time_feat,
            batch.past_target.clone(),
            batch.past_observed_values.clone(),
            batch.past_is_pad.clone(),
            Some(TeacherForcing {
                time_feat: batch.future_time_feat,
                target: batch.future_target.clone(),
            }),
            batch.target_dimension_indicator,
        );

        // [N, C + P, D]
        let target = Tensor::cat(
            vec![
                batch.past_target.slice([0..n, context.clone(), 0..dim]),
                batch.future_target,
            ],
            1,
        );

        let distr_args = self.distr_args(encoded.outputs);
        let likelihoods: Tensor<B, 3> = self
            .diffusion
            .log_prob(target, distr_args.clone(), &encoded.scale)
            .unsqueeze_dim(2);

        let past_observed_values =
            effective_observed(batch.past_observed_values, batch.past_is_pad);
        let observed_values = Tensor::cat(
            vec![
                past_observed_values.slice([0..n, context, 0..dim]),
                batch.future_observed_values,
            ],
            1,
        );

        // a step counts only when every target dimension is observed
        let loss_weights = observed_values.min_dim(2);
        let loss = weighted_average(likelihoods.clone(), loss_weights.clone(), 1);

        LossOutput {
            loss: loss.mean(),
            likelihoods,
            loss_weights,
            distr_args,
        }
    }

    /// Loss in the shape burn's learner tracks: `output` holds the per-step
    /// likelihood terms and `targets` the step weights, both `[N, C + P]`.
    pub fn forward_regression(&self, batch: TimeGradBatch<B>) -> RegressionOutput<B> {
        let out = self.loss(batch);
        let [n, steps, _] = out.likelihoods.dims();

        RegressionOutput::new(
            out.loss,
            out.likelihoods.reshape([n, steps]),
            out.loss_weights.reshape([n, steps]),
        )
    }

    /// Draws `num_parallel_samples` sample paths per series, shape
    /// `[N, S, P, D]`.
    pub fn forward(&self, batch: TimeGradBatch<B>) -> Tensor<B, 4> {
        let encoded = self.encoder.unroll_encoder(
            batch.past_time_feat,
            batch.past_target.clone(),
            batch.past_observed_values,
            batch.past_is_pad,
            None,
            batch.target_dimension_indicator.clone(),
        );

        self.sampling_decoder(
            batch.past_target,
            batch.target_dimension_indicator,
            batch.future_time_feat,
            encoded.state,
            &encoded.scale,
        )
    }

    pub fn sampling_decoder(
        &self,
        past_target: Tensor<B, 3>,                     // [N, H, D]
        target_dimension_indicator: Tensor<B, 2, Int>, // [N, D]
        time_feat: Tensor<B, 3>,                       // [N, P, F]
        begin_states: RecurrentState<B>,
        scale: &ScaleParams<B>,
    ) -> Tensor<B, 4> {
        let samples = self.num_parallel_samples;
        let [batch, _, _] = past_target.dims();
        let [_, _, num_feat] = time_feat.dims();

        let mut repeated_past_target = repeat_interleave(past_target, samples);
        let repeated_time_feat = repeat_interleave(time_feat, samples);
        let repeated_scale = scale.repeat_interleave(samples);
        let repeated_indicator = repeat_interleave(target_dimension_indicator, samples);
        let mut repeated_states = begin_states.repeat_along_batch(samples);

        let rows = batch * samples;
        let mut future_samples = Vec::with_capacity(self.prediction_length);

        for k in 0..self.prediction_length {
            let lags = lagged_subsequences(
                repeated_past_target.clone(),
                self.history_length() + k,
                self.encoder.shifted_lags(),
                1,
            );

            let unrolled = self.encoder.unroll(
                lags,
                &repeated_scale,
                repeated_time_feat.clone().slice([0..rows, k..k + 1, 0..num_feat]),
                repeated_indicator.clone(),
                1,
                Some(repeated_states),
            );
            repeated_states = unrolled.state;

            let distr_args = self.distr_args(unrolled.outputs);

            // [N * S, 1, D]
            let new_samples = self.diffusion.sample(distr_args, &repeated_scale);

            future_samples.push(new_samples.clone());
            repeated_past_target = Tensor::cat(vec![repeated_past_target, new_samples], 1);
        }

        Tensor::cat(future_samples, 1).reshape([
            batch,
            samples,
            self.prediction_length,
            self.target_dim,
        ])
    }
}

impl<B: AutodiffBackend> TrainStep<TimeGradBatch<B>, RegressionOutput<B>> for TimeGradModel<B> {
    fn step(&self, batch: TimeGradBatch<B>) -> TrainOutput<RegressionOutput<B>> {
        let item = self.forward_regression(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<TimeGradBatch<B>, RegressionOutput<B>> for TimeGradModel<B> {
    fn step(&self, batch: TimeGradBatch<B>) -> RegressionOutput<B> {
        self.forward_regression(batch)
    }
}

impl<B: Backend> Checkpointable for TimeGradModel<B> {
    fn save_checkpoint(&self, path: &Path) -> crate::error::Result<()> {
        self.clone()
            .save_file(path.to_path_buf(), &CompactRecorder::new())
            .map_err(|err| ForecastError::Checkpoint {
                path: path.display().to_string(),
                reason: err.to_string(),
            })
    }

    fn load_checkpoint(self, path: &Path) -> crate::error::Result<Self> {
        self.load_file(path.to_path_buf(), &CompactRecorder::new())
            .map_err(|err| ForecastError::Checkpoint {
                path: path.display().to_string(),
                reason: err.to_string(),
            })
    }
}

#[derive(Config, Debug)]
pub struct TimeGradModelConfig {
    pub target_dim: usize,
    pub context_length: usize,
    pub prediction_length: usize,
    pub lags_seq: Vec<usize>,

    /// Width of the time-feature input, every column included.
    #[config(default = 0)]
    pub num_feat_dynamic_real: usize,

    #[config(default = 100)]
    pub num_parallel_samples: usize,

    #[config(default = 2)]
    pub num_layers: usize,

    #[config(default = 40)]
    pub num_cells: usize,

    #[config(default = "CellType::Lstm")]
    pub cell_type: CellType,

    #[config(default = 0.1)]
    pub dropout_rate: f64,

    #[config(default = 100)]
    pub conditioning_length: usize,

    #[config(default = 100)]
    pub diff_steps: usize,

    #[config(default = "LossType::L2")]
    pub loss_type: LossType,

    #[config(default = 0.1)]
    pub beta_end: f64,

    #[config(default = "BetaSchedule::Linear")]
    pub beta_schedule: BetaSchedule,

    #[config(default = 8)]
    pub residual_layers: usize,

    #[config(default = 8)]
    pub residual_channels: usize,

    #[config(default = 2)]
    pub dilation_cycle_length: usize,

    #[config(default = 5)]
    pub embedding_dimension: usize,

    #[config(default = true)]
    pub scaling: bool,

    #[config(default = "ScalerConfig::new()")]
    pub scaler: ScalerConfig,
}

impl TimeGradModelConfig {
    pub fn encoder(&self) -> SequenceEncoderConfig {
        SequenceEncoderConfig::new(
            self.target_dim,
            self.context_length,
            self.prediction_length,
            self.lags_seq.clone(),
            self.scaler.clone(),
        )
        .with_scaling(self.scaling)
        .with_num_feat_dynamic_real(self.num_feat_dynamic_real)
        .with_embedding_dimension(self.embedding_dimension)
        .with_cell_type(self.cell_type)
        .with_num_layers(self.num_layers)
        .with_num_cells(self.num_cells)
        .with_dropout_rate(self.dropout_rate)
    }

    pub fn init<B: Backend>(&self) -> crate::error::Result<TimeGradModel<B>> {
        if self.target_dim == 0 || self.prediction_length == 0 || self.num_parallel_samples == 0 {
            return Err(ForecastError::InvalidConfig(
                "target_dim, prediction_length and num_parallel_samples must be positive"
                    .to_string(),
            ));
        }

        let encoder_config = self.encoder();
        let encoder = encoder_config.init()?;
        tracing::info!("Setting input_size to {}", encoder_config.input_size());

        let denoise_fn = EpsilonThetaConfig::new(self.target_dim, self.conditioning_length, self.diff_steps)
            .with_residual_layers(self.residual_layers)
            .with_residual_channels(self.residual_channels)
            .with_dilation_cycle_length(self.dilation_cycle_length);

        let diffusion = GaussianDiffusionConfig::new(denoise_fn, self.target_dim)
            .with_diff_steps(self.diff_steps)
            .with_loss_type(self.loss_type)
            .with_beta_end(self.beta_end)
            .with_beta_schedule(self.beta_schedule)
            .init()?;

        let proj_dist_args = DiffusionOutputConfig::new(self.conditioning_length)
            .args_proj(self.num_cells);

        Ok(TimeGradModel {
            encoder,
            proj_dist_args,
            diffusion,
            target_dim: self.target_dim,
            context_length: self.context_length,
            prediction_length: self.prediction_length,
            num_parallel_samples: self.num_parallel_samples,
        })
    }
}
