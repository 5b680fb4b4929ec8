use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::ForecastError;
use crate::utils::repeat_interleave;

/// Normalisation statistics of a target window, each `[N, 1, D]`.
#[derive(Debug, Clone)]
pub enum ScaleParams<B: Backend> {
    Scale(Tensor<B, 3>),
    MeanStd { mean: Tensor<B, 3>, std: Tensor<B, 3> },
}

impl<B: Backend> ScaleParams<B> {
    /// Maps raw values `[N, T, D]` into the normalised space.
    pub fn normalize(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            ScaleParams::Scale(scale) => x / scale.clone(),
            ScaleParams::MeanStd { mean, std } => (x - mean.clone()) / std.clone(),
        }
    }

    /// Inverse of [`ScaleParams::normalize`].
    pub fn denormalize(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            ScaleParams::Scale(scale) => x * scale.clone(),
            ScaleParams::MeanStd { mean, std } => x * std.clone() + mean.clone(),
        }
    }

    /// Normalises lagged values `[N, S, D, I]`.
    pub fn normalize_lags(&self, lags: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ScaleParams::Scale(scale) => lags / scale.clone().unsqueeze_dim(3),
            ScaleParams::MeanStd { mean, std } => {
                (lags - mean.clone().unsqueeze_dim(3)) / std.clone().unsqueeze_dim(3)
            }
        }
    }

    /// Repeats every field along the batch axis, see [`repeat_interleave`].
    pub fn repeat_interleave(&self, repeats: usize) -> Self {
        match self {
            ScaleParams::Scale(scale) => {
                ScaleParams::Scale(repeat_interleave(scale.clone(), repeats))
            }
            ScaleParams::MeanStd { mean, std } => ScaleParams::MeanStd {
                mean: repeat_interleave(mean.clone(), repeats),
                std: repeat_interleave(std.clone(), repeats),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScalerType {
    Mean,
    MeanStd,
    CenteredMean,
    Nops,
}

impl FromStr for ScalerType {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(ScalerType::Mean),
            "mean_std" => Ok(ScalerType::MeanStd),
            "centered_mean" => Ok(ScalerType::CenteredMean),
            "nops" | "nop" => Ok(ScalerType::Nops),
            other => Err(ForecastError::UnknownScaler(other.to_string())),
        }
    }
}

impl fmt::Display for ScalerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalerType::Mean => "mean",
            ScalerType::MeanStd => "mean_std",
            ScalerType::CenteredMean => "centered_mean",
            ScalerType::Nops => "nops",
        };
        f.write_str(name)
    }
}

/// Scales by the mean absolute observed value.
#[derive(Module, Debug, Clone)]
pub struct MeanScaler {
    minimum_scale: f32,
}

impl MeanScaler {
    pub fn scale<B: Backend>(&self, data: Tensor<B, 3>, observed: Tensor<B, 3>) -> Tensor<B, 3> {
        let batch = data.dims()[0];

        let num_observed = observed.clone().sum_dim(1);
        let sum_observed = (data.abs() * observed).sum_dim(1);

        // per-dimension scale over the whole batch, used for series without
        // any observed non-zero value
        let default_scale =
            sum_observed.clone().sum_dim(0) / num_observed.clone().sum_dim(0).clamp_min(1.0);

        let scale = sum_observed.clone() / num_observed.clamp_min(1.0);
        let use_default = sum_observed.lower_equal_elem(0.0);

        scale
            .mask_where(use_default, default_scale.repeat(0, batch))
            .clamp_min(self.minimum_scale)
    }
}

/// Standardises by the observed mean and standard deviation.
#[derive(Module, Debug, Clone)]
pub struct MeanStdScaler {
    minimum_std: f32,
    minimum_std_cst: f32,
    default_scale: bool,
    default_scale_cst: bool,
    add_minimum_std: bool,
}

impl MeanStdScaler {
    pub fn mean_std<B: Backend>(
        &self,
        data: Tensor<B, 3>,
        observed: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let batch = data.dims()[0];

        let num_observed = observed.clone().sum_dim(1);
        let denominator = num_observed.clone().clamp_min(1.0);
        let mean = (data.clone() * observed.clone()).sum_dim(1) / denominator.clone();
        let deviation = (data.clone() - mean.clone()) * observed.clone();
        let std = ((deviation.clone() * deviation).sum_dim(1) / denominator).sqrt();

        let unobserved = num_observed.clone().equal_elem(0.0);
        let (mean, std) = if self.default_scale {
            let total = num_observed.sum_dim(0).clamp_min(1.0);
            let batch_mean = (data.clone() * observed.clone()).sum_dim(1).sum_dim(0) / total.clone();
            let deviation = (data - batch_mean.clone()) * observed;
            let batch_std = ((deviation.clone() * deviation).sum_dim(1).sum_dim(0) / total).sqrt();

            (
                mean.mask_where(unobserved.clone(), batch_mean.repeat(0, batch)),
                std.mask_where(unobserved, batch_std.repeat(0, batch)),
            )
        } else {
            (mean.mask_fill(unobserved.clone(), 0.0), std.mask_fill(unobserved, 1.0))
        };

        let std = if self.default_scale_cst {
            let constant = std.clone().lower_elem(self.minimum_std_cst);
            std.mask_fill(constant, 1.0)
        } else {
            std
        };

        let std = if self.add_minimum_std {
            std + self.minimum_std
        } else {
            std.clamp_min(self.minimum_std)
        };

        (mean, std)
    }
}

/// Centres by the observed mean, then scales by the mean absolute deviation.
#[derive(Module, Debug, Clone)]
pub struct CenteredMeanScaler {
    spread: MeanScaler,
}

impl CenteredMeanScaler {
    pub fn mean_std<B: Backend>(
        &self,
        data: Tensor<B, 3>,
        observed: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let denominator = observed.clone().sum_dim(1).clamp_min(1.0);
        let mean = (data.clone() * observed.clone()).sum_dim(1) / denominator;
        let centered = (data - mean.clone()) * observed.clone();
        let std = self.spread.scale(centered, observed);

        (mean, std)
    }
}

/// Scaling strategy resolved from a [`ScalerType`]; no variant set means the
/// identity scaling.
#[derive(Module, Debug, Clone)]
pub struct Scaler {
    mean: Option<MeanScaler>,
    mean_std: Option<MeanStdScaler>,
    centered_mean: Option<CenteredMeanScaler>,
}

impl Scaler {
    pub fn identity() -> Self {
        Self {
            mean: None,
            mean_std: None,
            centered_mean: None,
        }
    }

    /// Computes the scale of `data` (`[N, T, D]`) over the `observed` steps
    /// and returns the normalised window along with it.
    pub fn compute_scale<B: Backend>(
        &self,
        data: Tensor<B, 3>,
        observed: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, ScaleParams<B>) {
        let data = data.detach().set_require_grad(false);
        let observed = observed.detach().set_require_grad(false);

        let params = match (&self.mean, &self.mean_std, &self.centered_mean) {
            (Some(scaler), _, _) => ScaleParams::Scale(scaler.scale(data.clone(), observed)),
            (_, Some(scaler), _) => {
                let (mean, std) = scaler.mean_std(data.clone(), observed);
                ScaleParams::MeanStd { mean, std }
            }
            (_, _, Some(scaler)) => {
                let (mean, std) = scaler.mean_std(data.clone(), observed);
                ScaleParams::MeanStd { mean, std }
            }
            _ => {
                let [batch, _, dim] = data.dims();
                ScaleParams::Scale(data.clone().slice([0..batch, 0..1, 0..dim]).ones_like())
            }
        };

        (params.normalize(data), params)
    }
}

#[derive(Config, Debug)]
pub struct ScalerConfig {
    #[config(default = "ScalerType::Mean")]
    pub scaler_type: ScalerType,

    #[config(default = 1e-10)]
    pub minimum_scale: f32,

    #[config(default = 1e-3)]
    pub minimum_std: f32,

    #[config(default = 1e-4)]
    pub minimum_std_cst: f32,

    #[config(default = true)]
    pub default_scale: bool,

    #[config(default = true)]
    pub default_scale_cst: bool,

    #[config(default = true)]
    pub add_minimum_std: bool,

    /// Accepted for configuration compatibility; the scalers above always
    /// divide by their spread statistic.
    #[config(default = false)]
    pub div_by_std: bool,
}

impl ScalerConfig {
    pub fn init(&self) -> Scaler {
        if self.div_by_std {
            tracing::warn!("div_by_std is set but has no effect on {} scaling", self.scaler_type);
        }

        let mut scaler = Scaler::identity();
        match self.scaler_type {
            ScalerType::Mean => {
                scaler.mean = Some(MeanScaler {
                    minimum_scale: self.minimum_scale,
                })
            }
            ScalerType::MeanStd => {
                scaler.mean_std = Some(MeanStdScaler {
                    minimum_std: self.minimum_std,
                    minimum_std_cst: self.minimum_std_cst,
                    default_scale: self.default_scale,
                    default_scale_cst: self.default_scale_cst,
                    add_minimum_std: self.add_minimum_std,
                })
            }
            ScalerType::CenteredMean => {
                scaler.centered_mean = Some(CenteredMeanScaler {
                    spread: MeanScaler {
                        minimum_scale: self.minimum_scale,
                    },
                })
            }
            ScalerType::Nops => {}
        }

        scaler
    }
}
