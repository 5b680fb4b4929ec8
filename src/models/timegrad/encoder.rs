use burn::config::Config;
use burn::module::Module;
use burn::nn::{Embedding, EmbeddingConfig};
use burn::tensor::{backend::Backend, Int, Tensor};

use crate::modules::rnn::{CellType, RecurrentState, StackedRecurrent, StackedRecurrentConfig};

use super::lags::{lagged_subsequences, LagConfig};
use super::scaler::{ScaleParams, Scaler, ScalerConfig};

pub struct UnrollOutput<B: Backend> {
    pub outputs: Tensor<B, 3>,       // [N, S, H]
    pub state: RecurrentState<B>,
    pub lags_scaled: Tensor<B, 4>,   // [N, S, D, I]
    pub inputs: Tensor<B, 3>,        // [N, S, input_size]
}

pub struct EncoderOutput<B: Backend> {
    pub outputs: Tensor<B, 3>,
    pub state: RecurrentState<B>,
    pub scale: ScaleParams<B>,
    pub lags_scaled: Tensor<B, 4>,
    pub inputs: Tensor<B, 3>,
}

/// Future part of a window, fed to the encoder while training.
pub struct TeacherForcing<B: Backend> {
    pub time_feat: Tensor<B, 3>, // [N, P, F]
    pub target: Tensor<B, 3>,    // [N, P, D]
}

/// Marks padded steps as unobserved: `observed * (1 - is_pad)`.
pub fn effective_observed<B: Backend>(
    observed: Tensor<B, 3>, // [N, T, D]
    is_pad: Tensor<B, 2>,   // [N, T]
) -> Tensor<B, 3> {
    observed * (is_pad.unsqueeze_dim::<3>(2).neg() + 1.0)
}

#[derive(Module, Debug)]
pub struct SequenceEncoder<B: Backend> {
    rnn: StackedRecurrent<B>,
    embed: Option<Embedding<B>>,
    scaler: Scaler,
    lags_seq: Vec<usize>,
    shifted_lags: Vec<usize>,
    target_dim: usize,
    embed_dim: usize,
    context_length: usize,
    prediction_length: usize,
    history_length: usize,
}

impl<B: Backend> SequenceEncoder<B> {
    pub fn history_length(&self) -> usize {
        self.history_length
    }

    pub fn lags(&self) -> &[usize] {
        &self.lags_seq
    }

    pub fn shifted_lags(&self) -> &[usize] {
        &self.shifted_lags
    }

    pub fn rnn(&self) -> &StackedRecurrent<B> {
        &self.rnn
    }

    pub fn unroll(
        &self,
        lags: Tensor<B, 4>,                              // [N, S, D, I]
        scale: &ScaleParams<B>,
        time_feat: Tensor<B, 3>,                         // [N, S, F]
        target_dimension_indicator: Tensor<B, 2, Int>,   // [N, D]
        unroll_length: usize,
        begin_state: Option<RecurrentState<B>>,
    ) -> UnrollOutput<B> {
        let [batch, _, _, num_lags] = lags.dims();

        let lags_scaled = scale.normalize_lags(lags);
        let input_lags = lags_scaled
            .clone()
            .reshape([batch, unroll_length, num_lags * self.target_dim]);

        let mut features = vec![input_lags];

        if let Some(embed) = &self.embed {
            // [N, D, E] -> [N, S, D * E]
            let index_embeddings: Tensor<B, 4> =
                embed.forward(target_dimension_indicator).unsqueeze_dim(1);
            features.push(
                index_embeddings
                    .repeat(1, unroll_length)
                    .reshape([batch, unroll_length, self.target_dim * self.embed_dim]),
            );
        }

        if time_feat.dims()[2] > 0 {
            features.push(time_feat);
        }

        let inputs = Tensor::cat(features, 2);
        let (outputs, state) = self.rnn.forward(inputs.clone(), begin_state);

        UnrollOutput {
            outputs,
            state,
            lags_scaled,
            inputs,
        }
    }

    /// Unrolls over the past window and, when `future` is given, over the
    /// prediction range as well.
    ///
    /// The scale only ever sees the last `context_length` past steps.
    pub fn unroll_encoder(
        &self,
        past_time_feat: Tensor<B, 3>,         // [N, H, F]
        past_target: Tensor<B, 3>,            // [N, H, D]
        past_observed_values: Tensor<B, 3>,   // [N, H, D]
        past_is_pad: Tensor<B, 2>,            // [N, H]
        future: Option<TeacherForcing<B>>,
        target_dimension_indicator: Tensor<B, 2, Int>,
    ) -> EncoderOutput<B> {
        let [batch, history, target_dim] = past_target.dims();
        let num_feat = past_time_feat.dims()[2];
        assert_eq!(
            history, self.history_length,
            "past target must span the history length"
        );

        let past_observed_values = effective_observed(past_observed_values, past_is_pad);
        let context = history - self.context_length..history;
        let past_time_feat = past_time_feat.slice([0..batch, context.clone(), 0..num_feat]);

        let (time_feat, sequence, sequence_length, subsequences_length) = match future {
            Some(future) => (
                Tensor::cat(vec![past_time_feat, future.time_feat], 1),
                Tensor::cat(vec![past_target.clone(), future.target], 1),
                self.history_length + self.prediction_length,
                self.context_length + self.prediction_length,
            ),
            None => (
                past_time_feat,
                past_target.clone(),
                self.history_length,
                self.context_length,
            ),
        };

        let lags = lagged_subsequences(sequence, sequence_length, &self.lags_seq, subsequences_length);

        let (_, scale) = self.scaler.compute_scale(
            past_target.slice([0..batch, context.clone(), 0..target_dim]),
            past_observed_values.slice([0..batch, context, 0..target_dim]),
        );

        let unrolled = self.unroll(
            lags,
            &scale,
            time_feat,
            target_dimension_indicator,
            subsequences_length,
            None,
        );

        EncoderOutput {
            outputs: unrolled.outputs,
            state: unrolled.state,
            scale,
            lags_scaled: unrolled.lags_scaled,
            inputs: unrolled.inputs,
        }
    }
}

#[derive(Config, Debug)]
pub struct SequenceEncoderConfig {
    target_dim: usize,
    context_length: usize,
    prediction_length: usize,
    lags_seq: Vec<usize>,
    scaler: ScalerConfig,

    #[config(default = true)]
    scaling: bool,

    #[config(default = 0)]
    num_feat_dynamic_real: usize,

    #[config(default = 5)]
    embedding_dimension: usize,

    #[config(default = "CellType::Lstm")]
    cell_type: CellType,

    #[config(default = 2)]
    num_layers: usize,

    #[config(default = 40)]
    num_cells: usize,

    #[config(default = 0.1)]
    dropout_rate: f64,
}

impl SequenceEncoderConfig {
    pub fn input_size(&self) -> usize {
        let lags = LagConfig::new(&self.lags_seq, self.context_length)
            .map(|lags| lags.lags().len())
            .unwrap_or(0);

        lags * self.target_dim + self.target_dim * self.embedding_dimension + self.num_feat_dynamic_real
    }

    pub fn init<B: Backend>(&self) -> crate::error::Result<SequenceEncoder<B>> {
        let lags = LagConfig::new(&self.lags_seq, self.context_length)?;
        let input_size = self.input_size();

        let embed = if self.embedding_dimension > 0 {
            Some(EmbeddingConfig::new(self.target_dim, self.embedding_dimension).init())
        } else {
            None
        };

        let scaler = if self.scaling {
            self.scaler.init()
        } else {
            Scaler::identity()
        };

        let rnn = StackedRecurrentConfig::new(self.cell_type, input_size, self.num_cells)
            .with_num_layers(self.num_layers)
            .with_dropout(self.dropout_rate)
            .init();

        Ok(SequenceEncoder {
            rnn,
            embed,
            scaler,
            lags_seq: lags.lags().to_vec(),
            shifted_lags: lags.shifted().to_vec(),
            target_dim: self.target_dim,
            embed_dim: self.embedding_dimension,
            context_length: self.context_length,
            prediction_length: self.prediction_length,
            history_length: lags.history_length(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::timegrad::scaler::ScalerType;
    use crate::utils::{float_tensor, int_tensor, to_vec};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    const BATCH: usize = 2;
    const DIM: usize = 3;
    const CONTEXT: usize = 4;
    const PREDICTION: usize = 2;

    fn config(scaler_type: ScalerType) -> SequenceEncoderConfig {
        SequenceEncoderConfig::new(
            DIM,
            CONTEXT,
            PREDICTION,
            vec![1, 2],
            ScalerConfig::new().with_scaler_type(scaler_type),
        )
        .with_num_feat_dynamic_real(1)
        .with_embedding_dimension(2)
        .with_num_cells(8)
    }

    fn indicator() -> Tensor<TestBackend, 2, Int> {
        int_tensor(vec![0, 1, 2, 0, 1, 2], [BATCH, DIM])
    }

    fn ramp(time: usize, offset: f32) -> Tensor<TestBackend, 3> {
        let values = (0..BATCH * time * DIM).map(|v| v as f32 + offset).collect();
        float_tensor(values, [BATCH, time, DIM])
    }

    #[test]
    fn input_size_counts_lags_embeddings_and_features() {
        assert_eq!(config(ScalerType::Mean).input_size(), 2 * 3 + 3 * 2 + 1);
    }

    #[test]
    fn teacher_forced_unroll_spans_context_and_prediction() {
        let encoder: SequenceEncoder<TestBackend> = config(ScalerType::Mean).init().unwrap();
        let history = encoder.history_length();

        let out = encoder.unroll_encoder(
            Tensor::ones([BATCH, history, 1]),
            ramp(history, 1.0),
            Tensor::ones([BATCH, history, DIM]),
            Tensor::zeros([BATCH, history]),
            Some(TeacherForcing {
                time_feat: Tensor::ones([BATCH, PREDICTION, 1]),
                target: ramp(PREDICTION, 1.0),
            }),
            indicator(),
        );

        assert_eq!(history, 6);
        assert_eq!(out.outputs.dims(), [BATCH, CONTEXT + PREDICTION, 8]);
        assert_eq!(out.lags_scaled.dims(), [BATCH, CONTEXT + PREDICTION, DIM, 2]);
        assert_eq!(out.inputs.dims(), [BATCH, CONTEXT + PREDICTION, 13]);
        assert_eq!(out.state.num_layers(), 2);
    }

    #[test]
    fn scale_ignores_future_and_padded_steps() {
        let encoder: SequenceEncoder<TestBackend> = config(ScalerType::MeanStd).init().unwrap();
        let history = encoder.history_length();
        let past = ramp(history, 1.0);

        let scale_of = |future: Option<TeacherForcing<TestBackend>>| {
            let out = encoder.unroll_encoder(
                Tensor::ones([BATCH, history, 1]),
                past.clone(),
                Tensor::ones([BATCH, history, DIM]),
                Tensor::zeros([BATCH, history]),
                future,
                indicator(),
            );
            match out.scale {
                ScaleParams::MeanStd { mean, std } => (to_vec(mean), to_vec(std)),
                ScaleParams::Scale(_) => panic!("mean_std scaler returned a plain scale"),
            }
        };

        let without = scale_of(None);
        let with = scale_of(Some(TeacherForcing {
            time_feat: Tensor::ones([BATCH, PREDICTION, 1]),
            target: ramp(PREDICTION, 1000.0),
        }));

        assert_eq!(without, with);
    }

    #[test]
    fn padded_context_steps_do_not_count_as_observed() {
        let observed = Tensor::<TestBackend, 3>::ones([1, 3, 2]);
        let is_pad = float_tensor::<TestBackend, 2>(vec![1.0, 0.0, 0.0], [1, 3]);

        assert_eq!(
            to_vec(effective_observed(observed, is_pad)),
            vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn lags_scaled_round_trip_to_raw_values() {
        let encoder: SequenceEncoder<TestBackend> = config(ScalerType::Mean).init().unwrap();
        let history = encoder.history_length();
        let past = ramp(history, 1.0);

        let out = encoder.unroll_encoder(
            Tensor::ones([BATCH, history, 1]),
            past.clone(),
            Tensor::ones([BATCH, history, DIM]),
            Tensor::zeros([BATCH, history]),
            None,
            indicator(),
        );

        let ScaleParams::Scale(scale) = out.scale else {
            panic!("mean scaler returned mean/std");
        };
        let restored = out.lags_scaled * scale.unsqueeze_dim(3);
        let expected = lagged_subsequences(past, history, &[1, 2], CONTEXT);

        for (a, b) in to_vec(restored).iter().zip(to_vec(expected)) {
            assert!((a - b).abs() < 1e-3 * b.abs().max(1.0), "{a} != {b}");
        }
    }

    #[test]
    fn gru_encoder_without_embedding() {
        let encoder: SequenceEncoder<TestBackend> = config(ScalerType::CenteredMean)
            .with_cell_type(CellType::Gru)
            .with_embedding_dimension(0)
            .init()
            .unwrap();
        let history = encoder.history_length();

        let out = encoder.unroll_encoder(
            Tensor::ones([BATCH, history, 1]),
            ramp(history, 0.0),
            Tensor::ones([BATCH, history, DIM]),
            Tensor::zeros([BATCH, history]),
            None,
            indicator(),
        );

        assert_eq!(out.inputs.dims(), [BATCH, CONTEXT, 2 * DIM + 1]);
        assert!(matches!(out.state, RecurrentState::Single(_)));
    }
}
