use burn::tensor::{backend::Backend, Tensor};

use crate::error::{ForecastError, Result};

/// Returns lagged subsequences of `sequence` (shape `[N, T, C]`).
///
/// The result has shape `[N, S, C, I]` with `S = subsequences_length` and
/// `I = indices.len()`, where
/// `lagged[n, t, c, i] = sequence[n, T - indices[i] - S + t, c]`.
pub fn lagged_subsequences<B: Backend>(
    sequence: Tensor<B, 3>,
    sequence_length: usize,
    indices: &[usize],
    subsequences_length: usize,
) -> Tensor<B, 4> {
    let [batch, time, channels] = sequence.dims();
    let max_lag = indices.iter().copied().max().unwrap_or(0);

    assert!(!indices.is_empty(), "at least one lag index is required");
    assert!(
        time == sequence_length,
        "sequence has {time} steps but a length of {sequence_length} was given"
    );
    assert!(
        max_lag + subsequences_length <= sequence_length,
        "lags cannot go further than history length, found lag {max_lag} \
         while history length is only {sequence_length}"
    );

    let lagged: Vec<Tensor<B, 4>> = indices
        .iter()
        .map(|lag| {
            let end = sequence_length - lag;
            let begin = end - subsequences_length;
            sequence
                .clone()
                .slice([0..batch, begin..end, 0..channels])
                .unsqueeze_dim(3)
        })
        .collect();

    Tensor::cat(lagged, 3)
}

/// The lag offsets fed to the encoder.
///
/// `lags_seq` is ascending and deduplicated. `shifted` holds every lag minus
/// one and is used while decoding, where the freshly sampled value is not yet
/// part of the history: shifted lag 0 points at the last known value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagConfig {
    lags_seq: Vec<usize>,
    shifted: Vec<usize>,
    context_length: usize,
}

impl LagConfig {
    pub fn new(lags: &[usize], context_length: usize) -> Result<Self> {
        let mut lags_seq = lags.to_vec();
        lags_seq.sort_unstable();
        lags_seq.dedup();

        if lags_seq.is_empty() {
            return Err(ForecastError::InvalidLags("no lag given".to_string()));
        }
        if lags_seq[0] == 0 {
            return Err(ForecastError::InvalidLags(
                "lag 0 would feed the target to itself".to_string(),
            ));
        }
        if context_length == 0 {
            return Err(ForecastError::InvalidLags(
                "context length must be positive".to_string(),
            ));
        }

        let shifted = lags_seq.iter().map(|lag| lag - 1).collect();

        Ok(Self {
            lags_seq,
            shifted,
            context_length,
        })
    }

    pub fn lags(&self) -> &[usize] {
        &self.lags_seq
    }

    pub fn shifted(&self) -> &[usize] {
        &self.shifted
    }

    pub fn max_lag(&self) -> usize {
        self.lags_seq[self.lags_seq.len() - 1]
    }

    pub fn history_length(&self) -> usize {
        self.context_length + self.max_lag()
    }
}

/// Default lag offsets for a pandas-style frequency string such as `"H"`,
/// `"15min"` or `"D"`.
///
/// The set always contains lags 1 to 7, followed by seasonal lags of the
/// frequency and their immediate neighbours.
pub fn lags_for_frequency(freq: &str) -> Result<Vec<usize>> {
    let split = freq
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(freq.len());
    let (multiple, unit) = freq.split_at(split);
    let multiple: usize = if multiple.is_empty() {
        1
    } else {
        multiple
            .parse()
            .map_err(|_| ForecastError::InvalidConfig(format!("frequency `{freq}`")))?
    };
    if multiple == 0 {
        return Err(ForecastError::InvalidConfig(format!("frequency `{freq}`")));
    }

    let seasons: Vec<usize> = match unit {
        "S" => vec![60, 3600],
        "T" | "min" => vec![60 / multiple.min(60), 24 * 60 / multiple],
        "H" => vec![24 / multiple.min(24), 7 * 24 / multiple],
        "D" => vec![7 / multiple.min(7), 30 / multiple],
        "B" => vec![5 / multiple.min(5), 20 / multiple],
        "W" => vec![4 / multiple.min(4), 52 / multiple],
        "M" => vec![3 / multiple.min(3), 12 / multiple],
        "Q" => vec![4 / multiple.min(4)],
        "A" | "Y" => vec![],
        _ => return Err(ForecastError::InvalidConfig(format!("frequency `{freq}`"))),
    };

    let mut lags: Vec<usize> = (1..=7).collect();
    for season in seasons.into_iter().filter(|s| *s > 1) {
        lags.extend([season - 1, season, season + 1]);
    }
    lags.sort_unstable();
    lags.dedup();

    Ok(lags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{float_tensor, to_vec};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp(batch: usize, time: usize, channels: usize) -> Tensor<TestBackend, 3> {
        let values = (0..batch * time * channels).map(|v| v as f32).collect();
        float_tensor(values, [batch, time, channels])
    }

    #[test]
    fn lagged_values_follow_offsets() {
        let (batch, time, channels) = (2, 7, 3);
        let lags = [1, 3];
        let subsequences = 4;
        let sequence = ramp(batch, time, channels);

        let lagged = lagged_subsequences(sequence, time, &lags, subsequences);
        assert_eq!(lagged.dims(), [batch, subsequences, channels, lags.len()]);

        let values = to_vec(lagged);
        for b in 0..batch {
            for t in 0..subsequences {
                for c in 0..channels {
                    for (i, lag) in lags.iter().enumerate() {
                        let source = time - lag - subsequences + t;
                        let expected = (b * time * channels + source * channels + c) as f32;
                        let index = ((b * subsequences + t) * channels + c) * lags.len() + i;
                        assert_eq!(values[index], expected, "b={b} t={t} c={c} lag={lag}");
                    }
                }
            }
        }
    }

    #[test]
    fn lag_zero_is_last_value() {
        let sequence = ramp(1, 5, 1);
        let lagged = lagged_subsequences(sequence, 5, &[0], 1);

        assert_eq!(to_vec(lagged), vec![4.0]);
    }

    #[test]
    #[should_panic(expected = "lags cannot go further than history length")]
    fn lag_window_past_history_panics() {
        let sequence = ramp(1, 6, 2);
        lagged_subsequences(sequence, 6, &[1, 3], 4);
    }

    #[test]
    #[should_panic]
    fn sequence_length_mismatch_panics() {
        let sequence = ramp(1, 6, 2);
        lagged_subsequences(sequence, 8, &[1], 2);
    }

    #[test]
    fn lag_config_sorts_and_shifts() {
        let config = LagConfig::new(&[24, 1, 2, 24], 4).unwrap();

        assert_eq!(config.lags(), &[1, 2, 24]);
        assert_eq!(config.shifted(), &[0, 1, 23]);
        assert_eq!(config.history_length(), 28);
    }

    #[test]
    fn lag_config_rejects_zero_and_empty() {
        assert!(matches!(
            LagConfig::new(&[0, 1], 4),
            Err(ForecastError::InvalidLags(_))
        ));
        assert!(matches!(
            LagConfig::new(&[], 4),
            Err(ForecastError::InvalidLags(_))
        ));
    }

    #[test]
    fn hourly_lags_include_daily_and_weekly_seasons() {
        let lags = lags_for_frequency("H").unwrap();

        assert_eq!(&lags[..7], &[1, 2, 3, 4, 5, 6, 7]);
        for season in [23, 24, 25, 167, 168, 169] {
            assert!(lags.contains(&season), "missing {season}");
        }
        assert!(lags_for_frequency("fortnight").is_err());
    }
}
