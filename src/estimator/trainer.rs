use std::fmt::Display;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use burn::config::Config;
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use burn::train::metric::LossMetric;
use burn::train::renderer::{MetricState, MetricsRenderer, TrainingProgress};
use burn::train::{LearnerBuilder, RegressionOutput, TrainStep, ValidStep};

use crate::data::loader::BatchSource;
use crate::error::ForecastError;

use super::callbacks::{lock, next_version_dir, Callback, Checkpointable, EpochMetrics};
use super::{Trainer, TrainerBuilder, TrainingPlan};

/// Progress renderer supplied by the caller, fed every learner update.
pub type MetricRenderer = Box<dyn MetricsRenderer + Send>;

#[derive(Config)]
pub struct TrainerConfig {
    #[config(default = 100)]
    pub num_epochs: usize,

    #[config(default = 1e-3)]
    pub learning_rate: f64,

    #[config(
        default = "AdamConfig::new().with_grad_clipping(Some(GradientClippingConfig::Norm(10.0)))"
    )]
    pub optimizer: AdamConfig,

    #[config(default = 42)]
    pub seed: u64,
}

// `AdamConfig` does not implement `Debug`, so it is rendered via its `Display`.
impl std::fmt::Debug for TrainerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerConfig")
            .field("num_epochs", &self.num_epochs)
            .field("learning_rate", &self.learning_rate)
            .field("optimizer", &format_args!("{}", self.optimizer))
            .field("seed", &self.seed)
            .finish()
    }
}

#[derive(Default, Debug)]
struct LossTotals {
    train: (f64, usize),
    valid: (f64, usize),
}

impl LossTotals {
    fn mean((total, steps): (f64, usize)) -> Option<f64> {
        (steps > 0).then(|| total / steps as f64)
    }
}

fn loss_value(state: &MetricState) -> Option<f64> {
    match state {
        MetricState::Numeric(entry, value) if entry.name == "Loss" => Some(*value),
        _ => None,
    }
}

/// Renderer handed to each learner: sums the per-batch losses of the epoch
/// and forwards every update to the caller's renderer.
struct EpochRenderer {
    totals: Arc<Mutex<LossTotals>>,
    logger: Option<Arc<Mutex<MetricRenderer>>>,
}

impl MetricsRenderer for EpochRenderer {
    fn update_train(&mut self, state: MetricState) {
        if let Some(value) = loss_value(&state) {
            let mut totals = lock(&self.totals);
            totals.train.0 += value;
            totals.train.1 += 1;
        }
        if let Some(logger) = &self.logger {
            lock(logger).update_train(state);
        }
    }

    fn update_valid(&mut self, state: MetricState) {
        if let Some(value) = loss_value(&state) {
            let mut totals = lock(&self.totals);
            totals.valid.0 += value;
            totals.valid.1 += 1;
        }
        if let Some(logger) = &self.logger {
            lock(logger).update_valid(state);
        }
    }

    fn render_train(&mut self, item: TrainingProgress) {
        tracing::trace!("epoch {} iteration {}", item.epoch, item.iteration);
        if let Some(logger) = &self.logger {
            lock(logger).render_train(item);
        }
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        if let Some(logger) = &self.logger {
            lock(logger).render_valid(item);
        }
    }
}

/// Latest epoch checkpointed by a learner in `artifact_dir`.
fn latest_epoch(artifact_dir: &Path) -> crate::error::Result<usize> {
    let dir = artifact_dir.join("checkpoint");
    let entries = std::fs::read_dir(&dir).map_err(|err| ForecastError::Checkpoint {
        path: dir.display().to_string(),
        reason: err.to_string(),
    })?;

    entries
        .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
        .filter_map(|name| {
            let stem = name.split('.').next()?;
            stem.strip_prefix("model-")?.parse::<usize>().ok()
        })
        .max()
        .ok_or_else(|| ForecastError::Checkpoint {
            path: dir.display().to_string(),
            reason: "no model checkpoint found".to_string(),
        })
}

/// Model record written by a learner for `epoch`.
pub fn model_checkpoint(artifact_dir: &Path, epoch: usize) -> PathBuf {
    artifact_dir.join("checkpoint").join(format!("model-{epoch}"))
}

/// Resolves `path` to a model record: a training directory stands for its
/// latest checkpoint, anything else is taken as a record path.
pub fn resolve_model_checkpoint(path: &Path) -> crate::error::Result<PathBuf> {
    if path.is_dir() {
        Ok(model_checkpoint(path, latest_epoch(path)?))
    } else {
        Ok(path.to_path_buf())
    }
}

/// Copies the model, optimizer and scheduler records of the latest epoch in
/// `source` into `artifact_dir` and returns that epoch.
fn resume_from(source: &Path, artifact_dir: &Path) -> crate::error::Result<usize> {
    let epoch = latest_epoch(source)?;
    let from = source.join("checkpoint");
    let to = artifact_dir.join("checkpoint");
    let error = |path: &Path, err: std::io::Error| ForecastError::Checkpoint {
        path: path.display().to_string(),
        reason: err.to_string(),
    };

    std::fs::create_dir_all(&to).map_err(|err| error(&to, err))?;
    let suffix = format!("-{epoch}");
    let entries = std::fs::read_dir(&from).map_err(|err| error(&from, err))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name();
        let matches = name
            .to_str()
            .and_then(|name| name.split('.').next())
            .is_some_and(|stem| stem.ends_with(&suffix));
        if matches {
            let target = to.join(&name);
            std::fs::copy(entry.path(), &target).map_err(|err| error(&target, err))?;
        }
    }

    Ok(epoch)
}

/// Epoch loop on burn's [`Learner`](burn::train::Learner).
///
/// Every epoch is one learner run resumed from the previous epoch's
/// checkpoint, so the callbacks see the network between epochs while the
/// learner keeps the optimizer state, metric logs and checkpoints under
/// [`artifact_dir`](Self::artifact_dir).
pub struct BurnTrainer<B: AutodiffBackend, N> {
    config: TrainerConfig,
    device: B::Device,
    checkpoint_dir: PathBuf,
    callbacks: Vec<Box<dyn Callback<N>>>,
    logger: Option<Arc<Mutex<MetricRenderer>>>,
    history: Vec<EpochMetrics>,
    artifact_dir: Option<PathBuf>,
}

impl<B: AutodiffBackend, N> BurnTrainer<B, N> {
    pub fn new(config: TrainerConfig, device: B::Device, plan: TrainingPlan<N>) -> Self {
        Self {
            config,
            device,
            checkpoint_dir: plan.checkpoint_dir,
            callbacks: plan.callbacks,
            logger: plan.logger.map(|logger| Arc::new(Mutex::new(logger))),
            history: Vec::new(),
            artifact_dir: None,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    /// Learner directory of the last `fit`; pass it as `ckpt_path` to resume.
    pub fn artifact_dir(&self) -> Option<&Path> {
        self.artifact_dir.as_deref()
    }

    /// Best checkpoint recorded by any callback.
    pub fn best_model_path(&self) -> Option<PathBuf> {
        self.callbacks.iter().find_map(|callback| callback.best_model_path())
    }

    fn record(&mut self, metrics: EpochMetrics) -> crate::error::Result<()> {
        tracing::info!(
            "epoch {}: train_loss={:?} val_loss={:?}",
            metrics.epoch,
            metrics.train_loss,
            metrics.val_loss
        );
        for (metric, value) in [("train_loss", metrics.train_loss), ("val_loss", metrics.val_loss)] {
            if let Some(value) = value.filter(|value| !value.is_finite()) {
                return Err(ForecastError::NonFiniteLoss {
                    metric,
                    epoch: metrics.epoch,
                    value,
                });
            }
        }
        self.history.push(metrics);
        Ok(())
    }
}

impl<B, N, L> Trainer<N, L> for BurnTrainer<B, N>
where
    B: AutodiffBackend,
    N: AutodiffModule<B>
        + TrainStep<L::TrainBatch, RegressionOutput<B>>
        + Checkpointable
        + Display
        + 'static,
    N::InnerModule: ValidStep<L::ValidBatch, RegressionOutput<B::InnerBackend>>,
    L: BatchSource,
    L::TrainBatch: Send + 'static,
    L::ValidBatch: Send + 'static,
{
    fn fit(
        &mut self,
        network: N,
        mut train_loader: L,
        mut val_loader: Option<L>,
        ckpt_path: Option<&Path>,
    ) -> crate::error::Result<N> {
        let artifact_dir = next_version_dir(&self.checkpoint_dir, "training")?;
        let (mut network, start_epoch) = match ckpt_path {
            Some(path) => {
                let epoch = resume_from(path, &artifact_dir)?;
                tracing::info!("resuming after epoch {} from {}", epoch, path.display());
                let network = network.load_checkpoint(&model_checkpoint(&artifact_dir, epoch))?;
                (network, epoch)
            }
            None => (network, 0),
        };
        let directory = artifact_dir.display().to_string();
        self.artifact_dir = Some(artifact_dir);

        B::seed(self.config.seed);
        for callback in self.callbacks.iter_mut() {
            callback.on_train_begin(&network)?;
        }

        for epoch in start_epoch + 1..=self.config.num_epochs {
            let totals = Arc::new(Mutex::new(LossTotals::default()));
            let renderer = EpochRenderer {
                totals: totals.clone(),
                logger: self.logger.clone(),
            };

            let mut builder = LearnerBuilder::new(&directory)
                .metric_train_numeric(LossMetric::<B>::new())
                .metric_valid_numeric(LossMetric::<B::InnerBackend>::new())
                .with_file_checkpointer(CompactRecorder::new())
                .devices(vec![self.device.clone()])
                .num_epochs(epoch)
                .renderer(renderer);
            if epoch > 1 {
                builder = builder.checkpoint(epoch - 1);
            }
            let learner = builder.build(
                network,
                self.config.optimizer.init(),
                self.config.learning_rate,
            );

            let valid = match val_loader.as_mut() {
                Some(loader) => loader.valid_pass(),
                None => train_loader.no_valid(),
            };
            network = learner.fit(train_loader.train_pass(), valid);

            let metrics = {
                let totals = lock(&totals);
                EpochMetrics {
                    epoch,
                    train_loss: LossTotals::mean(totals.train),
                    val_loss: LossTotals::mean(totals.valid),
                }
            };
            self.record(metrics.clone())?;

            let mut keep_going = true;
            for callback in self.callbacks.iter_mut() {
                if metrics.val_loss.is_some() {
                    callback.on_validation_end(&metrics, &network)?;
                }
                keep_going &= callback.on_epoch_end(&metrics, &network)?;
            }
            if !keep_going {
                tracing::info!("training stopped by a callback after epoch {}", epoch);
                break;
            }
        }

        Ok(network)
    }

    fn validate(
        &mut self,
        network: N,
        mut loader: L,
        ckpt_path: Option<&Path>,
    ) -> crate::error::Result<(N, EpochMetrics)> {
        let network = match ckpt_path {
            Some(path) => network.load_checkpoint(&resolve_model_checkpoint(path)?)?,
            None => network,
        };

        let model = network.valid();
        let (mut total, mut steps) = (0.0, 0);
        for batch in loader.valid_pass().iter() {
            let output = <N::InnerModule as ValidStep<L::ValidBatch, RegressionOutput<B::InnerBackend>>>::step(
                &model, batch,
            );
            total += output.loss.into_scalar().elem::<f64>();
            steps += 1;
        }

        let metrics = EpochMetrics {
            epoch: 0,
            train_loss: None,
            val_loss: LossTotals::mean((total, steps)),
        };
        self.record(metrics.clone())?;
        for callback in self.callbacks.iter_mut() {
            callback.on_validation_end(&metrics, &network)?;
        }

        Ok((network, metrics))
    }

    fn best_model_path(&self) -> Option<PathBuf> {
        BurnTrainer::best_model_path(self)
    }
}

#[derive(Clone, Debug)]
pub struct BurnTrainerBuilder<B: AutodiffBackend> {
    config: TrainerConfig,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> BurnTrainerBuilder<B> {
    pub fn new(config: TrainerConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            _backend: PhantomData,
        }
    }
}

impl<B, N, L> TrainerBuilder<N, L> for BurnTrainerBuilder<B>
where
    B: AutodiffBackend,
    BurnTrainer<B, N>: Trainer<N, L>,
{
    type Trainer = BurnTrainer<B, N>;

    fn build(&self, plan: TrainingPlan<N>) -> crate::error::Result<Self::Trainer> {
        if self.config.learning_rate <= 0.0 {
            return Err(ForecastError::InvalidConfig(format!(
                "learning rate {} must be positive",
                self.config.learning_rate
            )));
        }
        tracing::debug!("building trainer monitoring {}", plan.monitor);

        Ok(BurnTrainer::new(self.config.clone(), self.device.clone(), plan))
    }
}
