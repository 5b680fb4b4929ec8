//! TimeGrad: multivariate probabilistic forecasting with a recurrent encoder
//! and a denoising diffusion output head, built on burn.

pub mod data;
pub mod error;
pub mod estimator;
pub mod models;
pub mod modules;
pub mod utils;

pub use error::{ForecastError, Result};
