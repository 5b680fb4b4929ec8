pub mod diffusion;
pub mod encoder;
pub mod epsilon_theta;
pub mod estimator;
pub mod lags;
pub mod model;
pub mod predictor;
pub mod projector;
pub mod scaler;

pub use estimator::{TimeGradEstimator, TimeGradEstimatorConfig};
pub use model::{TimeGradModel, TimeGradModelConfig};
pub use predictor::{SampleForecast, TimeGradPredictor};
