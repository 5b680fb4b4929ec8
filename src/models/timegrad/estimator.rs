use std::sync::Arc;

use burn::config::Config;
use burn::data::dataset::Dataset;
use burn::module::Module;
use burn::tensor::backend::AutodiffBackend;

use crate::data::item::MultivariateItem;
use crate::data::loader::{WindowLoader, WindowLoaderConfig};
use crate::data::transform::{TimeGradTransformation, TimeSeriesEntry};
use crate::error::ForecastError;
use crate::estimator::trainer::{BurnTrainerBuilder, TrainerConfig};
use crate::estimator::{Estimator, ModelComponents};

use super::lags::lags_for_frequency;
use super::model::{TimeGradModel, TimeGradModelConfig};
use super::predictor::TimeGradPredictor;

#[derive(Config, Debug)]
pub struct TimeGradEstimatorConfig {
    pub model: TimeGradModelConfig,

    /// User covariates per series; the age feature is added on top.
    #[config(default = 0)]
    pub num_feat_dynamic_real: usize,

    #[config(default = "WindowLoaderConfig::new()")]
    pub loader: WindowLoaderConfig,

    #[config(default = "TrainerConfig::new()")]
    pub trainer: TrainerConfig,
}

impl TimeGradEstimatorConfig {
    /// Model configuration with the default lag set of `freq`.
    pub fn for_frequency(
        target_dim: usize,
        context_length: usize,
        prediction_length: usize,
        freq: &str,
    ) -> crate::error::Result<Self> {
        let lags = lags_for_frequency(freq)?;
        tracing::debug!("using lags {:?} for frequency {}", lags, freq);

        Ok(Self::new(TimeGradModelConfig::new(
            target_dim,
            context_length,
            prediction_length,
            lags,
        )))
    }
}

/// TimeGrad parts plugged into the generic [`Estimator`].
#[derive(Debug, Clone)]
pub struct TimeGradEstimator<B: AutodiffBackend> {
    config: TimeGradEstimatorConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> TimeGradEstimator<B> {
    pub fn new(config: TimeGradEstimatorConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &TimeGradEstimatorConfig {
        &self.config
    }

    /// Model configuration sized to the features the transformation emits.
    pub fn model_config(&self) -> TimeGradModelConfig {
        let num_time_features = self.create_transformation().num_time_features();
        self.config
            .model
            .clone()
            .with_num_feat_dynamic_real(num_time_features)
    }

    /// Estimator driven by the Adam trainer configured in `config.trainer`.
    pub fn into_estimator(self) -> Estimator<Self, BurnTrainerBuilder<B>> {
        let builder = BurnTrainerBuilder::new(self.config.trainer.clone(), self.device.clone());
        Estimator::new(self, builder)
    }
}

impl<B: AutodiffBackend> ModelComponents for TimeGradEstimator<B> {
    type Input = MultivariateItem;
    type Transformation = TimeGradTransformation;
    type Network = TimeGradModel<B>;
    type Loader = WindowLoader<B>;
    type Predictor = TimeGradPredictor<B>;

    fn create_transformation(&self) -> TimeGradTransformation {
        TimeGradTransformation::new(
            self.config.model.target_dim,
            self.config.model.prediction_length,
            self.config.num_feat_dynamic_real,
        )
    }

    fn create_network(&self) -> crate::error::Result<TimeGradModel<B>> {
        let network: TimeGradModel<B> = self.model_config().init()?;
        Ok(network.to_device(&self.device))
    }

    fn create_training_loader(
        &self,
        data: Arc<dyn Dataset<TimeSeriesEntry>>,
        network: &TimeGradModel<B>,
        shuffle_buffer_length: Option<usize>,
    ) -> crate::error::Result<WindowLoader<B>> {
        WindowLoader::training(
            data,
            self.device.clone(),
            network.history_length(),
            network.prediction_length(),
            &self.config.loader,
            shuffle_buffer_length,
        )
    }

    fn create_validation_loader(
        &self,
        data: Arc<dyn Dataset<TimeSeriesEntry>>,
        network: &TimeGradModel<B>,
    ) -> crate::error::Result<WindowLoader<B>> {
        WindowLoader::validation(
            data,
            self.device.clone(),
            network.history_length(),
            network.prediction_length(),
            &self.config.loader,
        )
    }

    fn create_predictor(
        &self,
        transformation: TimeGradTransformation,
        network: TimeGradModel<B>,
    ) -> TimeGradPredictor<B> {
        TimeGradPredictor::new(
            transformation,
            network,
            self.device.clone(),
            self.config.loader.batch_size,
        )
    }

    fn load_prior_network(
        &self,
        network: TimeGradModel<B>,
        predictor: &TimeGradPredictor<B>,
    ) -> crate::error::Result<TimeGradModel<B>> {
        let expected = network.signature();
        let found = predictor.network().signature();
        if expected != found {
            return Err(ForecastError::IncompatiblePredictor {
                expected: format!("{expected:?}"),
                found: format!("{found:?}"),
            });
        }

        Ok(network.load_record(predictor.network().clone().into_record()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataset::InMemDataset;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn config(prediction_length: usize) -> TimeGradEstimatorConfig {
        let model = TimeGradModelConfig::new(2, 4, prediction_length, vec![1, 2])
            .with_num_parallel_samples(2)
            .with_num_layers(1)
            .with_num_cells(4)
            .with_conditioning_length(4)
            .with_diff_steps(3)
            .with_residual_layers(1)
            .with_embedding_dimension(1);

        TimeGradEstimatorConfig::new(model)
            .with_loader(WindowLoaderConfig::new().with_batch_size(2).with_num_batches_per_epoch(1))
            .with_trainer(TrainerConfig::new().with_num_epochs(1))
    }

    fn series(item_id: &str, length: usize) -> MultivariateItem {
        MultivariateItem::new(
            item_id,
            vec![
                (0..length).map(|t| 1.0 + (t % 3) as f32).collect(),
                (0..length).map(|t| 2.0 + (t % 4) as f32).collect(),
            ],
        )
    }

    #[test]
    fn network_sees_covariates_and_age_feature() {
        let components = TimeGradEstimator::<TestBackend>::new(
            config(2).with_num_feat_dynamic_real(2),
            Default::default(),
        );

        assert_eq!(components.model_config().num_feat_dynamic_real, 3);
        assert_eq!(components.create_transformation().num_time_features(), 3);
    }

    #[test]
    fn frequency_config_uses_default_lags() {
        let config = TimeGradEstimatorConfig::for_frequency(3, 24, 12, "H").unwrap();

        assert!(config.model.lags_seq.contains(&24));
        assert!(config.model.lags_seq.contains(&168));
        assert!(TimeGradEstimatorConfig::for_frequency(3, 24, 12, "fortnight").is_err());
    }

    #[test]
    fn trains_and_predicts_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let components = TimeGradEstimator::<TestBackend>::new(config(2), Default::default());
        let mut estimator = components.into_estimator();
        estimator.options_mut().checkpoint_dir = dir.path().to_path_buf();

        let data = InMemDataset::new(vec![series("a", 16), series("b", 12)]);
        let output = estimator
            .train_model(data, None, None, None, true, None)
            .unwrap();

        let forecasts = output
            .predictor()
            .predict(&InMemDataset::new(vec![series("a", 16)]))
            .unwrap();

        assert_eq!(forecasts.len(), 1);
        assert_eq!(forecasts[0].item_id, "a");
        assert_eq!(forecasts[0].samples.len(), 2 * 2 * 2);
        assert!(forecasts[0].mean().iter().all(|v| v.is_finite()));
        assert!(output.trainer().best_model_path().is_some());
    }

    #[test]
    fn series_with_wrong_dimension_count_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let components = TimeGradEstimator::<TestBackend>::new(config(2), Default::default());
        let predictor = components.create_predictor(
            components.create_transformation(),
            components.create_network().unwrap(),
        );
        let mut estimator = components.into_estimator();
        estimator.options_mut().checkpoint_dir = dir.path().to_path_buf();
        let three_dims = MultivariateItem::new("c", vec![vec![1.0; 12]; 3]);

        let trained = estimator.train_model(
            InMemDataset::new(vec![series("a", 12), three_dims.clone()]),
            None,
            None,
            None,
            false,
            None,
        );
        let predicted = predictor.predict(&InMemDataset::new(vec![three_dims]));

        let expected = ForecastError::DimensionMismatch {
            item_id: "c".to_string(),
            expected: 2,
            found: 3,
        };
        assert!(matches!(trained, Err(ref err) if *err == expected));
        assert_eq!(predicted, Err(expected));
    }

    #[test]
    fn prior_with_other_horizon_is_rejected() {
        let trained = TimeGradEstimator::<TestBackend>::new(config(2), Default::default());
        let predictor = trained.create_predictor(
            trained.create_transformation(),
            trained.create_network().unwrap(),
        );

        let other = TimeGradEstimator::<TestBackend>::new(config(3), Default::default());
        let result = other.load_prior_network(other.create_network().unwrap(), &predictor);

        assert!(matches!(result, Err(ForecastError::IncompatiblePredictor { .. })));
    }
}
