use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use burn::module::Module;
use burn::tensor::{backend::Backend, Distribution, Int, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::ForecastError;
use crate::utils::{float_tensor, int_tensor};

use super::epsilon_theta::{EpsilonTheta, EpsilonThetaConfig};
use super::scaler::ScaleParams;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    L1,
    L2,
    Huber,
}

impl FromStr for LossType {
    type Err = ForecastError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "l1" => Ok(LossType::L1),
            "l2" => Ok(LossType::L2),
            "huber" => Ok(LossType::Huber),
            other => Err(ForecastError::UnknownLossType(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    Quad,
    Const,
    Cosine,
}

impl FromStr for BetaSchedule {
    type Err = ForecastError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "linear" => Ok(BetaSchedule::Linear),
            "quad" => Ok(BetaSchedule::Quad),
            "const" => Ok(BetaSchedule::Const),
            "cosine" => Ok(BetaSchedule::Cosine),
            other => Err(ForecastError::UnknownBetaSchedule(other.to_string())),
        }
    }
}

impl fmt::Display for BetaSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BetaSchedule::Linear => "linear",
            BetaSchedule::Quad => "quad",
            BetaSchedule::Const => "const",
            BetaSchedule::Cosine => "cosine",
        };
        f.write_str(name)
    }
}

const BETA_START: f64 = 1e-4;

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps == 1 {
        return vec![start];
    }
    let delta = (end - start) / (steps - 1) as f64;
    (0..steps).map(|i| start + delta * i as f64).collect()
}

impl BetaSchedule {
    pub fn betas(&self, steps: usize, beta_end: f64) -> Vec<f64> {
        match self {
            BetaSchedule::Linear => linspace(BETA_START, beta_end, steps),
            BetaSchedule::Quad => linspace(BETA_START.sqrt(), beta_end.sqrt(), steps)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            BetaSchedule::Const => vec![beta_end; steps],
            BetaSchedule::Cosine => {
                let s = 0.008;
                let cumprod: Vec<f64> = (0..=steps)
                    .map(|x| {
                        let angle = ((x as f64 / steps as f64) + s) / (1.0 + s) * PI * 0.5;
                        angle.cos().powi(2)
                    })
                    .collect();
                cumprod
                    .windows(2)
                    .map(|w| (1.0 - w[1] / w[0]).clamp(0.0, 0.9999))
                    .collect()
            }
        }
    }
}

/// Host-side coefficients of a discrete noise schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_alphas_cumprod: Vec<f64>,
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub sqrt_recip_alphas_cumprod: Vec<f64>,
    pub sqrt_recipm1_alphas_cumprod: Vec<f64>,
    pub posterior_mean_coef1: Vec<f64>,
    pub posterior_mean_coef2: Vec<f64>,
    pub posterior_log_variance_clipped: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(betas: Vec<f64>) -> Self {
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cumprod: Vec<f64> = alphas
            .iter()
            .scan(1.0, |acc, a| {
                *acc *= a;
                Some(*acc)
            })
            .collect();
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied())
            .take(betas.len())
            .collect();

        let mut posterior_mean_coef1 = Vec::with_capacity(betas.len());
        let mut posterior_mean_coef2 = Vec::with_capacity(betas.len());
        let mut posterior_log_variance_clipped = Vec::with_capacity(betas.len());
        for t in 0..betas.len() {
            let (acp, prev) = (alphas_cumprod[t], alphas_cumprod_prev[t]);
            let variance = betas[t] * (1.0 - prev) / (1.0 - acp);

            posterior_mean_coef1.push(betas[t] * prev.sqrt() / (1.0 - acp));
            posterior_mean_coef2.push((1.0 - prev) * alphas[t].sqrt() / (1.0 - acp));
            posterior_log_variance_clipped.push(variance.max(1e-20).ln());
        }

        let table = |f: fn(f64) -> f64| alphas_cumprod.iter().map(|a| f(*a)).collect::<Vec<f64>>();

        Self {
            sqrt_alphas_cumprod: table(|a| a.sqrt()),
            sqrt_one_minus_alphas_cumprod: table(|a| (1.0 - a).sqrt()),
            sqrt_recip_alphas_cumprod: table(|a| (1.0 / a).sqrt()),
            sqrt_recipm1_alphas_cumprod: table(|a| (1.0 / a - 1.0).sqrt()),
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            posterior_mean_coef1,
            posterior_mean_coef2,
            posterior_log_variance_clipped,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.betas.len()
    }
}

/// Denoising diffusion head over `D`-dimensional targets.
///
/// Both entry points take the active scale explicitly: targets are
/// normalised before noising and samples are mapped back after the reverse
/// chain. The schedule tables are filled once by
/// [`GaussianDiffusionConfig::init`].
#[derive(Module, Debug)]
pub struct GaussianDiffusion<B: Backend> {
    denoise_fn: EpsilonTheta<B>,
    betas: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    target_dim: usize,
    squared_error: bool,
    huber_delta: Option<f64>,
}

impl<B: Backend> GaussianDiffusion<B> {
    pub fn num_steps(&self) -> usize {
        self.betas.len()
    }

    pub fn loss_type(&self) -> LossType {
        match (self.huber_delta, self.squared_error) {
            (Some(_), _) => LossType::Huber,
            (None, true) => LossType::L2,
            (None, false) => LossType::L1,
        }
    }

    fn coefficients(values: &[f64], device: &B::Device) -> Tensor<B, 1> {
        let len = values.len();
        float_tensor::<B, 1>(values.iter().map(|v| *v as f32).collect(), [len]).to_device(device)
    }

    /// Per step denoising loss of `x` (`[N, T, D]`) given `cond`
    /// (`[N, T, C]`), shape `[N, T]`.
    pub fn log_prob(&self, x: Tensor<B, 3>, cond: Tensor<B, 3>, scale: &ScaleParams<B>) -> Tensor<B, 2> {
        let [batch, time, dim] = x.dims();
        let cond_length = cond.dims()[2];
        let device = x.device();
        let steps = self.num_steps();
        let n = batch * time;

        let x_start = scale.normalize(x).reshape([n, 1, dim]);
        let cond = cond.reshape([n, 1, cond_length]);

        let t: Tensor<B, 1, Int> = (Tensor::<B, 1>::random([n], Distribution::Default)
            .to_device(&device)
            * steps as f32)
            .clamp_max((steps - 1) as f32)
            .int();

        let a = Self::coefficients(&self.sqrt_alphas_cumprod, &device)
            .select(0, t.clone())
            .reshape([n, 1, 1]);
        let b = Self::coefficients(&self.sqrt_one_minus_alphas_cumprod, &device)
            .select(0, t.clone())
            .reshape([n, 1, 1]);

        let noise = Tensor::<B, 3>::random([n, 1, dim], Distribution::Normal(0.0, 1.0)).to_device(&device);
        let x_noisy = x_start * a + noise.clone() * b;
        let predicted = self.denoise_fn.forward(x_noisy, t, cond);

        let error = noise - predicted;
        let loss = match (self.huber_delta, self.squared_error) {
            (Some(delta), _) => {
                let abs = error.abs();
                let quadratic = abs.clone() * abs.clone() * 0.5;
                let linear = (abs.clone() - 0.5 * delta) * delta;
                quadratic.mask_where(abs.greater_elem(delta), linear)
            }
            (None, true) => error.clone() * error,
            (None, false) => error.abs(),
        };

        loss.mean_dim(2).reshape([batch, time])
    }

    /// Runs the reverse chain for every conditioning vector of `cond`
    /// (`[N, T, C]`) and returns samples `[N, T, D]` in the original scale.
    pub fn sample(&self, cond: Tensor<B, 3>, scale: &ScaleParams<B>) -> Tensor<B, 3> {
        let [batch, time, cond_length] = cond.dims();
        let device = cond.device();
        let n = batch * time;
        let dim = self.target_dim;

        let cond = cond.reshape([n, 1, cond_length]);
        let mut x = Tensor::<B, 3>::random([n, 1, dim], Distribution::Normal(0.0, 1.0)).to_device(&device);

        for step in (0..self.num_steps()).rev() {
            let t = int_tensor::<B, 1>(vec![step as i64; n], [n]).to_device(&device);
            let eps = self.denoise_fn.forward(x.clone(), t, cond.clone());

            let x_recon = x.clone() * self.sqrt_recip_alphas_cumprod[step]
                - eps * self.sqrt_recipm1_alphas_cumprod[step];
            let mean = x_recon * self.posterior_mean_coef1[step]
                + x * self.posterior_mean_coef2[step];

            x = if step > 0 {
                let sigma = (0.5 * self.posterior_log_variance_clipped[step]).exp();
                let noise = Tensor::<B, 3>::random([n, 1, dim], Distribution::Normal(0.0, 1.0))
                    .to_device(&device);
                mean + noise * sigma
            } else {
                mean
            };
        }

        scale.denormalize(x.reshape([batch, time, dim]))
    }
}

#[derive(Config, Debug)]
pub struct GaussianDiffusionConfig {
    denoise_fn: EpsilonThetaConfig,
    target_dim: usize,

    #[config(default = 100)]
    diff_steps: usize,

    #[config(default = "LossType::L2")]
    loss_type: LossType,

    #[config(default = 0.1)]
    beta_end: f64,

    #[config(default = "BetaSchedule::Linear")]
    beta_schedule: BetaSchedule,
}

impl GaussianDiffusionConfig {
    pub fn init<B: Backend>(&self) -> crate::error::Result<GaussianDiffusion<B>> {
        if self.diff_steps == 0 {
            return Err(ForecastError::InvalidConfig(
                "diffusion needs at least one step".to_string(),
            ));
        }

        let betas = self.beta_schedule.betas(self.diff_steps, self.beta_end);
        if betas.iter().any(|b| !(*b > 0.0 && *b < 1.0)) {
            return Err(ForecastError::InvalidConfig(format!(
                "{} schedule with beta_end {} leaves (0, 1)",
                self.beta_schedule, self.beta_end
            )));
        }

        let schedule = NoiseSchedule::new(betas);

        Ok(GaussianDiffusion {
            denoise_fn: self.denoise_fn.init(),
            betas: schedule.betas,
            sqrt_alphas_cumprod: schedule.sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod: schedule.sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod: schedule.sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod: schedule.sqrt_recipm1_alphas_cumprod,
            posterior_mean_coef1: schedule.posterior_mean_coef1,
            posterior_mean_coef2: schedule.posterior_mean_coef2,
            posterior_log_variance_clipped: schedule.posterior_log_variance_clipped,
            target_dim: self.target_dim,
            squared_error: self.loss_type == LossType::L2,
            huber_delta: (self.loss_type == LossType::Huber).then_some(1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::to_vec;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config(loss_type: LossType) -> GaussianDiffusionConfig {
        GaussianDiffusionConfig::new(
            EpsilonThetaConfig::new(3, 6, 5)
                .with_residual_layers(2)
                .with_residual_hidden(8),
            3,
        )
        .with_diff_steps(5)
        .with_loss_type(loss_type)
    }

    #[test]
    fn linear_schedule_spans_beta_range() {
        let betas = BetaSchedule::Linear.betas(5, 0.1);

        assert_eq!(betas.len(), 5);
        assert!((betas[0] - 1e-4).abs() < 1e-12);
        assert!((betas[4] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn cosine_schedule_is_increasing_and_bounded() {
        let betas = BetaSchedule::Cosine.betas(50, 0.1);

        assert!(betas.windows(2).all(|w| w[0] <= w[1]));
        assert!(betas.iter().all(|b| *b > 0.0 && *b <= 0.9999));
    }

    #[test]
    fn cumulative_alphas_decrease() {
        let schedule = NoiseSchedule::new(BetaSchedule::Quad.betas(10, 0.2));

        assert_eq!(schedule.alphas_cumprod_prev[0], 1.0);
        assert!(schedule.alphas_cumprod.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(schedule.alphas_cumprod_prev[3], schedule.alphas_cumprod[2]);
    }

    #[test]
    fn init_fills_the_schedule_tables() {
        let diffusion: GaussianDiffusion<TestBackend> = config(LossType::L2).init().unwrap();
        let schedule = NoiseSchedule::new(BetaSchedule::Linear.betas(5, 0.1));

        assert_eq!(diffusion.num_steps(), 5);
        assert_eq!(diffusion.sqrt_alphas_cumprod, schedule.sqrt_alphas_cumprod);
        assert_eq!(diffusion.sqrt_recipm1_alphas_cumprod, schedule.sqrt_recipm1_alphas_cumprod);
        assert_eq!(diffusion.posterior_mean_coef1, schedule.posterior_mean_coef1);
        assert_eq!(
            diffusion.posterior_log_variance_clipped,
            schedule.posterior_log_variance_clipped
        );
        for t in 0..5 {
            let acp = schedule.alphas_cumprod[t];
            assert!((schedule.sqrt_alphas_cumprod[t].powi(2) - acp).abs() < 1e-12);
            assert!((schedule.sqrt_recip_alphas_cumprod[t] * schedule.sqrt_alphas_cumprod[t] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn log_prob_is_per_step_and_finite() {
        for loss_type in [LossType::L1, LossType::L2, LossType::Huber] {
            let diffusion: GaussianDiffusion<TestBackend> = config(loss_type).init().unwrap();
            assert_eq!(diffusion.loss_type(), loss_type);

            let scale = ScaleParams::Scale(Tensor::ones([2, 1, 3]) * 2.0);
            let loss = diffusion.log_prob(Tensor::ones([2, 4, 3]), Tensor::ones([2, 4, 6]), &scale);

            assert_eq!(loss.dims(), [2, 4]);
            assert!(to_vec(loss).iter().all(|v| v.is_finite() && *v >= 0.0));
        }
    }

    #[test]
    fn sample_has_target_shape() {
        let diffusion: GaussianDiffusion<TestBackend> = config(LossType::L2).init().unwrap();
        let scale = ScaleParams::MeanStd {
            mean: Tensor::ones([2, 1, 3]),
            std: Tensor::ones([2, 1, 3]),
        };

        let samples = diffusion.sample(Tensor::zeros([2, 1, 6]), &scale);

        assert_eq!(samples.dims(), [2, 1, 3]);
        assert!(to_vec(samples).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rejects_betas_outside_unit_interval() {
        let result = config(LossType::L2)
            .with_beta_schedule(BetaSchedule::Const)
            .with_beta_end(1.0)
            .init::<TestBackend>();

        assert!(matches!(result, Err(ForecastError::InvalidConfig(_))));
    }

    #[test]
    fn parses_loss_and_schedule_names() {
        assert_eq!("huber".parse::<LossType>(), Ok(LossType::Huber));
        assert_eq!("cosine".parse::<BetaSchedule>(), Ok(BetaSchedule::Cosine));
        assert_eq!(
            "sigmoid".parse::<BetaSchedule>(),
            Err(ForecastError::UnknownBetaSchedule("sigmoid".to_string()))
        );
    }
}
