use std::ops::RangeInclusive;

use rand::Rng;

use super::transform::TimeSeriesEntry;

/// Where in a series the split between past and future is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceSampler {
    /// Uniform over every pivot leaving `min_past` observed steps and a full
    /// prediction window.
    Train { min_past: usize },
    /// The last full prediction window.
    Validation,
    /// The end of the series; the future is unknown.
    Test,
}

impl InstanceSampler {
    pub fn candidates(&self, length: usize, prediction_length: usize) -> Option<RangeInclusive<usize>> {
        match *self {
            InstanceSampler::Train { min_past } => {
                let first = min_past.max(1);
                let last = length.checked_sub(prediction_length)?;
                (first <= last).then_some(first..=last)
            }
            InstanceSampler::Validation => {
                let pivot = length.checked_sub(prediction_length)?;
                (pivot >= 1).then_some(pivot..=pivot)
            }
            InstanceSampler::Test => (length >= 1).then_some(length..=length),
        }
    }

    pub fn sample<R: Rng + ?Sized>(
        &self,
        length: usize,
        prediction_length: usize,
        rng: &mut R,
    ) -> Option<usize> {
        let range = self.candidates(length, prediction_length)?;
        if range.start() == range.end() {
            Some(*range.start())
        } else {
            Some(rng.gen_range(range))
        }
    }
}

/// A fixed-size training or inference window, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub item_id: String,
    pub target_dim: usize,
    pub num_time_feat: usize,
    /// `[history, dim]`
    pub past_target: Vec<f32>,
    pub past_observed: Vec<f32>,
    /// `[history]`, 1 where the row lies before the start of the series.
    pub past_is_pad: Vec<f32>,
    /// `[history, num_time_feat]`
    pub past_time_feat: Vec<f32>,
    /// `[prediction, dim]`, zeros past the end of the series.
    pub future_target: Vec<f32>,
    pub future_observed: Vec<f32>,
    /// `[prediction, num_time_feat]`
    pub future_time_feat: Vec<f32>,
}

impl Window {
    pub fn history_length(&self) -> usize {
        self.past_is_pad.len()
    }

    pub fn prediction_length(&self) -> usize {
        if self.target_dim == 0 {
            0
        } else {
            self.future_target.len() / self.target_dim
        }
    }
}

fn copy_rows(
    source: &[f32],
    width: usize,
    available: usize,
    rows: impl Iterator<Item = Option<usize>>,
    dest: &mut Vec<f32>,
) {
    for row in rows {
        match row.filter(|r| *r < available) {
            Some(r) => dest.extend_from_slice(&source[r * width..(r + 1) * width]),
            None => dest.extend(std::iter::repeat(0.0).take(width)),
        }
    }
}

/// Cuts `history_length` rows before `pivot` and `prediction_length` rows from
/// it, left padding the past with zeros where the series is too short.
pub fn slice_window(
    entry: &TimeSeriesEntry,
    pivot: usize,
    history_length: usize,
    prediction_length: usize,
) -> Window {
    let dim = entry.target_dim;
    let feat = entry.num_time_feat;
    let feat_length = entry.time_feat_length();
    let past_rows = || (0..history_length).map(|i| (pivot + i).checked_sub(history_length));
    let future_rows = || (pivot..pivot + prediction_length).map(Some);

    let mut past_target = Vec::with_capacity(history_length * dim);
    let mut past_observed = Vec::with_capacity(history_length * dim);
    let mut past_time_feat = Vec::with_capacity(history_length * feat);
    copy_rows(&entry.target, dim, entry.length, past_rows(), &mut past_target);
    copy_rows(&entry.observed, dim, entry.length, past_rows(), &mut past_observed);
    copy_rows(&entry.time_feat, feat, feat_length, past_rows(), &mut past_time_feat);

    let past_is_pad = past_rows()
        .map(|row| if row.is_some() { 0.0 } else { 1.0 })
        .collect();

    let mut future_target = Vec::with_capacity(prediction_length * dim);
    let mut future_observed = Vec::with_capacity(prediction_length * dim);
    let mut future_time_feat = Vec::with_capacity(prediction_length * feat);
    copy_rows(&entry.target, dim, entry.length, future_rows(), &mut future_target);
    copy_rows(&entry.observed, dim, entry.length, future_rows(), &mut future_observed);
    copy_rows(&entry.time_feat, feat, feat_length, future_rows(), &mut future_time_feat);

    Window {
        item_id: entry.item_id.clone(),
        target_dim: dim,
        num_time_feat: feat,
        past_target,
        past_observed,
        past_is_pad,
        past_time_feat,
        future_target,
        future_observed,
        future_time_feat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn entry(length: usize, feat_length: usize) -> TimeSeriesEntry {
        TimeSeriesEntry {
            item_id: "a".to_string(),
            target: (0..length * 2).map(|v| v as f32).collect(),
            observed: vec![1.0; length * 2],
            time_feat: (0..feat_length).map(|v| v as f32 * 10.0).collect(),
            length,
            target_dim: 2,
            num_time_feat: 1,
        }
    }

    #[test]
    fn sampler_ranges() {
        assert_eq!(
            InstanceSampler::Train { min_past: 1 }.candidates(10, 3),
            Some(1..=7)
        );
        assert_eq!(InstanceSampler::Train { min_past: 1 }.candidates(3, 3), None);
        assert_eq!(InstanceSampler::Validation.candidates(10, 3), Some(7..=7));
        assert_eq!(InstanceSampler::Validation.candidates(2, 3), None);
        assert_eq!(InstanceSampler::Test.candidates(10, 3), Some(10..=10));
    }

    #[test]
    fn train_samples_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let sampler = InstanceSampler::Train { min_past: 2 };

        for _ in 0..100 {
            let pivot = sampler.sample(12, 4, &mut rng).unwrap();
            assert!((2..=8).contains(&pivot));
        }
    }

    #[test]
    fn short_history_is_left_padded() {
        let window = slice_window(&entry(5, 5), 2, 4, 2);

        assert_eq!(window.past_is_pad, vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(window.past_target, vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
        assert_eq!(window.past_observed, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(window.future_target, vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(window.future_time_feat, vec![20.0, 30.0]);
        assert_eq!(window.history_length(), 4);
        assert_eq!(window.prediction_length(), 2);
    }

    #[test]
    fn test_window_has_empty_future_target_but_known_features() {
        let window = slice_window(&entry(4, 6), 4, 3, 2);

        assert_eq!(window.past_is_pad, vec![0.0, 0.0, 0.0]);
        assert_eq!(window.future_target, vec![0.0; 4]);
        assert_eq!(window.future_observed, vec![0.0; 4]);
        assert_eq!(window.future_time_feat, vec![40.0, 50.0]);
    }
}
