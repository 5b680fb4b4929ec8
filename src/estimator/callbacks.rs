use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use burn::record::{CompactRecorder, FileRecorder};

use crate::error::{ForecastError, Result};

/// Metric a checkpoint callback ranks epochs by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monitor {
    TrainLoss,
    ValLoss,
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Monitor::TrainLoss => f.write_str("train_loss"),
            Monitor::ValLoss => f.write_str("val_loss"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: Option<f64>,
    pub val_loss: Option<f64>,
}

impl EpochMetrics {
    pub fn get(&self, monitor: Monitor) -> Option<f64> {
        match monitor {
            Monitor::TrainLoss => self.train_loss,
            Monitor::ValLoss => self.val_loss,
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates the first `root/{prefix}-{n}` directory that does not exist yet.
///
/// Directory creation is atomic, so concurrent runs sharing `root` never end
/// up in the same directory.
pub fn next_version_dir(root: &Path, prefix: &str) -> Result<PathBuf> {
    let error = |path: &Path, err: std::io::Error| ForecastError::Checkpoint {
        path: path.display().to_string(),
        reason: err.to_string(),
    };
    std::fs::create_dir_all(root).map_err(|err| error(root, err))?;

    let mut version = 0;
    loop {
        let dir = root.join(format!("{prefix}-{version}"));
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => version += 1,
            Err(err) => return Err(error(&dir, err)),
        }
    }
}

/// A network that can be written to and restored from disk.
pub trait Checkpointable: Sized {
    fn save_checkpoint(&self, path: &Path) -> Result<()>;
    fn load_checkpoint(self, path: &Path) -> Result<Self>;
}

/// Hook run by the trainer. `on_epoch_end` returning `false` stops the run.
pub trait Callback<N>: Send {
    fn on_train_begin(&mut self, _network: &N) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _metrics: &EpochMetrics, _network: &N) -> Result<bool> {
        Ok(true)
    }

    fn on_validation_end(&mut self, _metrics: &EpochMetrics, _network: &N) -> Result<()> {
        Ok(())
    }

    /// Path of the best checkpoint written so far, for checkpointing hooks.
    fn best_model_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Keeps the checkpoint of the epoch with the lowest monitored value.
///
/// Checkpoints go to a `version-{n}` directory under `dirpath`, allocated on
/// the first save, so runs sharing `dirpath` never overwrite each other.
/// Clones share the best path, so the estimator can keep a handle after
/// moving the callback into a trainer.
#[derive(Clone)]
pub struct ModelCheckpoint {
    dirpath: PathBuf,
    monitor: Monitor,
    run_dir: Arc<Mutex<Option<PathBuf>>>,
    best: Arc<Mutex<Option<(f64, PathBuf)>>>,
}

impl ModelCheckpoint {
    pub fn new(dirpath: impl Into<PathBuf>, monitor: Monitor) -> Self {
        Self {
            dirpath: dirpath.into(),
            monitor,
            run_dir: Arc::new(Mutex::new(None)),
            best: Arc::new(Mutex::new(None)),
        }
    }

    /// Directory of this run's checkpoints, once one has been written.
    pub fn run_dir(&self) -> Option<PathBuf> {
        lock(&self.run_dir).clone()
    }

    fn ensure_run_dir(&self) -> Result<PathBuf> {
        let mut run_dir = lock(&self.run_dir);
        match run_dir.as_ref() {
            Some(dir) => Ok(dir.clone()),
            None => {
                let dir = next_version_dir(&self.dirpath, "version")?;
                *run_dir = Some(dir.clone());
                Ok(dir)
            }
        }
    }

    pub fn monitor(&self) -> Monitor {
        self.monitor
    }

    pub fn best_model_path(&self) -> Option<PathBuf> {
        lock(&self.best).as_ref().map(|(_, path)| path.clone())
    }

    pub fn best_model_score(&self) -> Option<f64> {
        lock(&self.best).as_ref().map(|(score, _)| *score)
    }

    /// Recorder file backing a checkpoint path.
    pub fn file_on_disk(path: &Path) -> PathBuf {
        path.with_extension(<CompactRecorder as FileRecorder>::file_extension())
    }

    fn update<N: Checkpointable>(&mut self, metrics: &EpochMetrics, network: &N) -> Result<()> {
        let Some(current) = metrics.get(self.monitor) else {
            return Ok(());
        };

        let previous = lock(&self.best).clone();
        if let Some((score, _)) = &previous {
            if current >= *score {
                return Ok(());
            }
        }

        let path = self
            .ensure_run_dir()?
            .join(format!("checkpoint-epoch-{}", metrics.epoch));
        network.save_checkpoint(&path)?;
        tracing::info!(
            "{} improved to {:.5} at epoch {}, saved {}",
            self.monitor,
            current,
            metrics.epoch,
            path.display()
        );

        if let Some((_, old)) = previous {
            if old != path {
                if let Err(err) = std::fs::remove_file(Self::file_on_disk(&old)) {
                    tracing::warn!("could not remove checkpoint {}: {}", old.display(), err);
                }
            }
        }

        *lock(&self.best) = Some((current, path));

        Ok(())
    }
}

impl<N: Checkpointable> Callback<N> for ModelCheckpoint {
    fn on_epoch_end(&mut self, metrics: &EpochMetrics, network: &N) -> Result<bool> {
        self.update(metrics, network)?;
        Ok(true)
    }

    fn best_model_path(&self) -> Option<PathBuf> {
        ModelCheckpoint::best_model_path(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeNetwork(&'static str);

    impl Checkpointable for FakeNetwork {
        fn save_checkpoint(&self, path: &Path) -> Result<()> {
            std::fs::write(ModelCheckpoint::file_on_disk(path), self.0).map_err(|err| {
                ForecastError::Checkpoint {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                }
            })
        }

        fn load_checkpoint(self, _path: &Path) -> Result<Self> {
            Ok(self)
        }
    }

    fn metrics(epoch: usize, train_loss: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: Some(train_loss),
            val_loss: None,
        }
    }

    #[test]
    fn keeps_only_the_best_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = ModelCheckpoint::new(dir.path(), Monitor::TrainLoss);
        let handle = checkpoint.clone();

        for (epoch, loss) in [(0, 3.0), (1, 2.0), (2, 2.5)] {
            Callback::on_epoch_end(&mut checkpoint, &metrics(epoch, loss), &FakeNetwork::default()).unwrap();
        }

        let run_dir = handle.run_dir().unwrap();
        let best = handle.best_model_path().unwrap();
        assert_eq!(run_dir, dir.path().join("version-0"));
        assert_eq!(best, run_dir.join("checkpoint-epoch-1"));
        assert_eq!(handle.best_model_score(), Some(2.0));
        assert!(ModelCheckpoint::file_on_disk(&best).exists());
        assert!(!ModelCheckpoint::file_on_disk(&run_dir.join("checkpoint-epoch-0")).exists());
        assert!(!ModelCheckpoint::file_on_disk(&run_dir.join("checkpoint-epoch-2")).exists());
    }

    #[test]
    fn runs_sharing_a_directory_keep_their_own_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = ModelCheckpoint::new(dir.path(), Monitor::TrainLoss);
        let mut second = ModelCheckpoint::new(dir.path(), Monitor::TrainLoss);

        Callback::on_epoch_end(&mut first, &metrics(0, 1.0), &FakeNetwork("first")).unwrap();
        Callback::on_epoch_end(&mut second, &metrics(0, 2.0), &FakeNetwork("second")).unwrap();

        let first_best = first.best_model_path().unwrap();
        let second_best = second.best_model_path().unwrap();
        assert_ne!(first_best, second_best);
        let read = |path: &Path| std::fs::read_to_string(ModelCheckpoint::file_on_disk(path)).unwrap();
        assert_eq!(read(&first_best), "first");
        assert_eq!(read(&second_best), "second");
    }

    #[test]
    fn version_dirs_are_allocated_in_order() {
        let dir = tempfile::tempdir().unwrap();

        let a = next_version_dir(dir.path(), "training").unwrap();
        let b = next_version_dir(dir.path(), "training").unwrap();

        assert_eq!(a, dir.path().join("training-0"));
        assert_eq!(b, dir.path().join("training-1"));
        assert!(a.is_dir() && b.is_dir());
    }

    #[test]
    fn missing_metric_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = ModelCheckpoint::new(dir.path(), Monitor::ValLoss);

        Callback::on_epoch_end(&mut checkpoint, &metrics(0, 1.0), &FakeNetwork::default()).unwrap();

        assert_eq!(checkpoint.best_model_path(), None);
    }
}
