pub mod callbacks;
pub mod trainer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::data::dataset::{Dataset, InMemDataset};

use crate::data::transform::Transformation;
use crate::error::Result;

use callbacks::{Callback, Checkpointable, EpochMetrics, ModelCheckpoint, Monitor};
use trainer::MetricRenderer;

/// What the estimator asks of a training loop.
pub trait Trainer<N, L> {
    /// Trains from `network`, or resumes the training run saved under
    /// `ckpt_path`, and returns the network as it stands after the last epoch.
    fn fit(
        &mut self,
        network: N,
        train_loader: L,
        val_loader: Option<L>,
        ckpt_path: Option<&Path>,
    ) -> Result<N>;

    /// A single evaluation pass without weight updates, on the weights at
    /// `ckpt_path` when given.
    fn validate(&mut self, network: N, loader: L, ckpt_path: Option<&Path>) -> Result<(N, EpochMetrics)>;

    /// Best checkpoint recorded by the checkpointing callback, if any.
    fn best_model_path(&self) -> Option<PathBuf>;
}

/// Everything a trainer is configured with for one run.
pub struct TrainingPlan<N> {
    pub monitor: Monitor,
    pub callbacks: Vec<Box<dyn Callback<N>>>,
    pub logger: Option<MetricRenderer>,
    /// Root of the run's checkpoint and metric directories.
    pub checkpoint_dir: PathBuf,
}

pub trait TrainerBuilder<N, L> {
    type Trainer: Trainer<N, L>;

    fn build(&self, plan: TrainingPlan<N>) -> Result<Self::Trainer>;
}

/// Per-run trainer options. Callbacks, logger and the validation-only flag
/// are consumed by the next training call.
pub struct TrainerOptions<N> {
    pub callbacks: Vec<Box<dyn Callback<N>>>,
    pub logger: Option<MetricRenderer>,
    pub validation_only: bool,
    pub checkpoint_dir: PathBuf,
}

impl<N> Default for TrainerOptions<N> {
    fn default() -> Self {
        Self {
            callbacks: Vec::new(),
            logger: None,
            validation_only: false,
            checkpoint_dir: PathBuf::from("checkpoints"),
        }
    }
}

pub type Entry<C> =
    <<C as ModelComponents>::Transformation as Transformation<<C as ModelComponents>::Input>>::Output;

/// The model-specific parts an [`Estimator`] is assembled from.
pub trait ModelComponents {
    type Input: Send + Sync + 'static;
    type Transformation: Transformation<Self::Input>;
    type Network: Checkpointable + Clone + Send + 'static;
    type Loader;
    type Predictor;

    fn create_transformation(&self) -> Self::Transformation;

    fn create_network(&self) -> Result<Self::Network>;

    fn create_training_loader(
        &self,
        data: Arc<dyn Dataset<<Self::Transformation as Transformation<Self::Input>>::Output>>,
        network: &Self::Network,
        shuffle_buffer_length: Option<usize>,
    ) -> Result<Self::Loader>;

    fn create_validation_loader(
        &self,
        data: Arc<dyn Dataset<<Self::Transformation as Transformation<Self::Input>>::Output>>,
        network: &Self::Network,
    ) -> Result<Self::Loader>;

    fn create_predictor(
        &self,
        transformation: Self::Transformation,
        network: Self::Network,
    ) -> Self::Predictor;

    /// Copies the weights held by `predictor` into `network`, failing when the
    /// two architectures differ.
    fn load_prior_network(
        &self,
        network: Self::Network,
        predictor: &Self::Predictor,
    ) -> Result<Self::Network>;
}

/// Result of a training run.
pub struct TrainOutput<T, N, TR, P> {
    transformation: T,
    network: N,
    trainer: TR,
    predictor: P,
}

impl<T, N, TR, P> TrainOutput<T, N, TR, P> {
    pub fn transformation(&self) -> &T {
        &self.transformation
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn trainer(&self) -> &TR {
        &self.trainer
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    pub fn into_predictor(self) -> P {
        self.predictor
    }
}

pub type EstimatorOutput<C, TB> = TrainOutput<
    <C as ModelComponents>::Transformation,
    <C as ModelComponents>::Network,
    <TB as TrainerBuilder<<C as ModelComponents>::Network, <C as ModelComponents>::Loader>>::Trainer,
    <C as ModelComponents>::Predictor,
>;

/// Drives a model through transformation, loader creation, training and
/// predictor assembly.
pub struct Estimator<C: ModelComponents, TB> {
    components: C,
    trainer_builder: TB,
    options: TrainerOptions<C::Network>,
}

impl<C, TB> Estimator<C, TB>
where
    C: ModelComponents,
    TB: TrainerBuilder<C::Network, C::Loader>,
{
    pub fn new(components: C, trainer_builder: TB) -> Self {
        Self {
            components,
            trainer_builder,
            options: TrainerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TrainerOptions<C::Network>) -> Self {
        self.options = options;
        self
    }

    pub fn components(&self) -> &C {
        &self.components
    }

    pub fn options_mut(&mut self) -> &mut TrainerOptions<C::Network> {
        &mut self.options
    }

    fn prepare<D>(
        &self,
        transformation: &C::Transformation,
        data: D,
        cache_data: bool,
    ) -> Result<Arc<dyn Dataset<Entry<C>>>>
    where
        D: Dataset<C::Input> + 'static,
    {
        for index in 0..data.len() {
            if let Some(item) = data.get(index) {
                transformation.check_entry(&item)?;
            }
        }

        let transformed = transformation.apply(data, true);
        if cache_data {
            let entries = (0..transformed.len())
                .filter_map(|index| transformed.get(index))
                .collect();
            Ok(Arc::new(InMemDataset::new(entries)))
        } else {
            Ok(Arc::new(transformed))
        }
    }

    pub fn train_model<D>(
        &mut self,
        training_data: D,
        validation_data: Option<D>,
        from_predictor: Option<&C::Predictor>,
        shuffle_buffer_length: Option<usize>,
        cache_data: bool,
        ckpt_path: Option<&Path>,
    ) -> Result<EstimatorOutput<C, TB>>
    where
        D: Dataset<C::Input> + 'static,
    {
        let user_callbacks = std::mem::take(&mut self.options.callbacks);
        let logger = self.options.logger.take();
        let validation_only = std::mem::take(&mut self.options.validation_only);

        let transformation = self.components.create_transformation();
        tracing::info!("Transforming training data");
        let training = self.prepare(&transformation, training_data, cache_data)?;
        let validation = validation_data
            .map(|data| {
                tracing::info!("Transforming validation data");
                self.prepare(&transformation, data, cache_data)
            })
            .transpose()?;

        let network = self.components.create_network()?;
        let training_loader =
            self.components
                .create_training_loader(training, &network, shuffle_buffer_length)?;
        let validation_loader = validation
            .map(|data| self.components.create_validation_loader(data, &network))
            .transpose()?;

        let network = match from_predictor {
            Some(predictor) => {
                tracing::info!("Initialising network weights from a trained predictor");
                self.components.load_prior_network(network, predictor)?
            }
            None => network,
        };

        let (monitor, callbacks) = match validation_loader {
            Some(_) => (Monitor::ValLoss, user_callbacks),
            None => {
                let checkpoint = ModelCheckpoint::new(&self.options.checkpoint_dir, Monitor::TrainLoss);
                let mut callbacks: Vec<Box<dyn Callback<C::Network>>> = vec![Box::new(checkpoint)];
                callbacks.extend(user_callbacks);
                (Monitor::TrainLoss, callbacks)
            }
        };
        tracing::info!("Monitoring {}", monitor);

        let mut trainer = self.trainer_builder.build(TrainingPlan {
            monitor,
            callbacks,
            logger,
            checkpoint_dir: self.options.checkpoint_dir.clone(),
        })?;

        let network = if validation_only {
            let loader = match validation_loader {
                Some(loader) => loader,
                None => training_loader,
            };
            tracing::info!("Running validation only");
            let (network, metrics) = trainer.validate(network, loader, ckpt_path)?;
            tracing::info!("Validation finished: val_loss={:?}", metrics.val_loss);
            network
        } else {
            tracing::info!("Starting training");
            let trained = trainer.fit(network, training_loader, validation_loader, ckpt_path)?;
            match trainer.best_model_path() {
                Some(path) => {
                    tracing::info!("Loading best model from {}", path.display());
                    trained.load_checkpoint(&path)?
                }
                None => {
                    tracing::warn!("No best checkpoint recorded, keeping the final network");
                    trained
                }
            }
        };

        let predictor = self
            .components
            .create_predictor(transformation.clone(), network.clone());

        Ok(TrainOutput {
            transformation,
            network,
            trainer,
            predictor,
        })
    }

    pub fn train<D>(
        &mut self,
        training_data: D,
        validation_data: Option<D>,
        shuffle_buffer_length: Option<usize>,
        cache_data: bool,
        ckpt_path: Option<&Path>,
    ) -> Result<C::Predictor>
    where
        D: Dataset<C::Input> + 'static,
    {
        self.train_model(
            training_data,
            validation_data,
            None,
            shuffle_buffer_length,
            cache_data,
            ckpt_path,
        )
        .map(TrainOutput::into_predictor)
    }

    /// Continues from the weights of an earlier predictor.
    pub fn train_from<D>(
        &mut self,
        predictor: &C::Predictor,
        training_data: D,
        validation_data: Option<D>,
        shuffle_buffer_length: Option<usize>,
        cache_data: bool,
        ckpt_path: Option<&Path>,
    ) -> Result<C::Predictor>
    where
        D: Dataset<C::Input> + 'static,
    {
        self.train_model(
            training_data,
            validation_data,
            Some(predictor),
            shuffle_buffer_length,
            cache_data,
            ckpt_path,
        )
        .map(TrainOutput::into_predictor)
    }
}
