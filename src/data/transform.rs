use std::marker::PhantomData;

use burn::data::dataset::transform::{Mapper, MapperDataset};
use burn::data::dataset::Dataset;

use super::item::MultivariateItem;
use crate::error::{ForecastError, Result};

/// Entry-wise preprocessing applied lazily to a dataset.
pub trait Transformation<I>: Clone + Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    /// Rejects inputs `map_entry` cannot represent faithfully.
    fn check_entry(&self, _entry: &I) -> Result<()> {
        Ok(())
    }

    fn map_entry(&self, entry: &I, is_train: bool) -> Self::Output;

    fn apply<D>(&self, dataset: D, is_train: bool) -> TransformedDataset<D, Self, I>
    where
        D: Dataset<I>,
        I: Send + Sync,
    {
        MapperDataset::new(
            dataset,
            EntryMapper {
                transformation: self.clone(),
                is_train,
                _input: PhantomData,
            },
        )
    }
}

pub struct EntryMapper<T, I> {
    transformation: T,
    is_train: bool,
    _input: PhantomData<fn(&I)>,
}

impl<T, I> Mapper<I, T::Output> for EntryMapper<T, I>
where
    T: Transformation<I>,
    I: Send + Sync,
{
    fn map(&self, item: &I) -> T::Output {
        self.transformation.map_entry(item, self.is_train)
    }
}

pub type TransformedDataset<D, T, I> = MapperDataset<D, EntryMapper<T, I>, I>;

/// A series after preprocessing, row-major `[time, dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesEntry {
    pub item_id: String,
    pub target: Vec<f32>,
    pub observed: Vec<f32>,
    /// `[time_feat_length, num_time_feat]`, longer than the target by the
    /// prediction length at inference.
    pub time_feat: Vec<f32>,
    pub length: usize,
    pub target_dim: usize,
    pub num_time_feat: usize,
}

impl TimeSeriesEntry {
    pub fn time_feat_length(&self) -> usize {
        if self.num_time_feat == 0 {
            0
        } else {
            self.time_feat.len() / self.num_time_feat
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeGradTransformation {
    target_dim: usize,
    prediction_length: usize,
    num_feat_dynamic_real: usize,
}

impl TimeGradTransformation {
    pub fn new(target_dim: usize, prediction_length: usize, num_feat_dynamic_real: usize) -> Self {
        Self {
            target_dim,
            prediction_length,
            num_feat_dynamic_real,
        }
    }

    /// User features followed by the age feature.
    pub fn num_time_features(&self) -> usize {
        self.num_feat_dynamic_real + 1
    }
}

impl Transformation<MultivariateItem> for TimeGradTransformation {
    type Output = TimeSeriesEntry;

    fn check_entry(&self, item: &MultivariateItem) -> Result<()> {
        if item.target_dim() == self.target_dim {
            Ok(())
        } else {
            Err(ForecastError::DimensionMismatch {
                item_id: item.item_id.clone(),
                expected: self.target_dim,
                found: item.target_dim(),
            })
        }
    }

    /// Extra target rows are dropped and missing ones stay unobserved.
    fn map_entry(&self, item: &MultivariateItem, is_train: bool) -> TimeSeriesEntry {
        let length = item.len();
        let dim = self.target_dim;
        let mut target = vec![0.0; length * dim];
        let mut observed = vec![0.0; length * dim];

        for (d, row) in item.target.iter().take(dim).enumerate() {
            for (t, value) in row.iter().take(length).enumerate() {
                let given = item
                    .observed_values
                    .as_ref()
                    .and_then(|obs| obs.get(d))
                    .and_then(|obs| obs.get(t))
                    .copied()
                    .unwrap_or(1.0);

                if value.is_finite() {
                    target[t * dim + d] = *value;
                    observed[t * dim + d] = given;
                }
            }
        }

        let feat_length = if is_train {
            length
        } else {
            length + self.prediction_length
        };
        let num_time_feat = self.num_time_features();
        let mut time_feat = vec![0.0; feat_length * num_time_feat];

        for f in 0..self.num_feat_dynamic_real {
            let row = item
                .feat_dynamic_real
                .as_ref()
                .and_then(|feats| feats.get(f))
                .map(|row| row.as_slice())
                .unwrap_or(&[]);
            // raw covariates are divided by their largest magnitude
            let max = row
                .iter()
                .filter(|v| v.is_finite())
                .fold(0.0f32, |acc, v| acc.max(v.abs()));

            for (t, value) in row.iter().take(feat_length).enumerate() {
                if value.is_finite() {
                    time_feat[t * num_time_feat + f] = value / (max + 1e-8);
                }
            }
        }

        for t in 0..feat_length {
            time_feat[t * num_time_feat + self.num_feat_dynamic_real] = (2.0 + t as f32).log10();
        }

        TimeSeriesEntry {
            item_id: item.item_id.clone(),
            target,
            observed,
            time_feat,
            length,
            target_dim: dim,
            num_time_feat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::data::dataset::InMemDataset;

    fn item() -> MultivariateItem {
        MultivariateItem::new("a", vec![vec![1.0, f32::NAN, 3.0], vec![4.0, 5.0, 6.0]])
    }

    #[test]
    fn missing_values_become_unobserved_zeros() {
        let entry = TimeGradTransformation::new(2, 2, 0).map_entry(&item(), true);

        assert_eq!(entry.target, vec![1.0, 4.0, 0.0, 5.0, 3.0, 6.0]);
        assert_eq!(entry.observed, vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn inference_extends_time_features() {
        let transformation = TimeGradTransformation::new(2, 2, 0);

        let train = transformation.map_entry(&item(), true);
        let test = transformation.map_entry(&item(), false);

        assert_eq!(train.time_feat_length(), 3);
        assert_eq!(test.time_feat_length(), 5);
        assert_eq!(test.time_feat[0], 2f32.log10());
        assert_eq!(test.time_feat[4], 6f32.log10());
    }

    #[test]
    fn dynamic_features_are_normalised_and_padded() {
        let mut item = item();
        item.feat_dynamic_real = Some(vec![vec![2.0, -4.0]]);
        let entry = TimeGradTransformation::new(2, 1, 1).map_entry(&item, true);

        assert_eq!(entry.num_time_feat, 2);
        let feature: Vec<f32> = entry.time_feat.iter().step_by(2).copied().collect();
        assert!((feature[0] - 0.5).abs() < 1e-6);
        assert!((feature[1] + 1.0).abs() < 1e-6);
        assert_eq!(feature[2], 0.0);
    }

    #[test]
    fn wrong_dimension_count_is_an_error() {
        let transformation = TimeGradTransformation::new(3, 2, 0);

        let result = transformation.check_entry(&item());

        assert_eq!(
            result,
            Err(ForecastError::DimensionMismatch {
                item_id: "a".to_string(),
                expected: 3,
                found: 2,
            })
        );
        let entry = transformation.map_entry(&item(), true);
        assert_eq!(entry.observed.iter().skip(2).step_by(3).sum::<f32>(), 0.0);
        assert!(TimeGradTransformation::new(2, 2, 0).check_entry(&item()).is_ok());
    }

    #[test]
    fn apply_is_lazy_and_entry_wise() {
        let dataset = InMemDataset::new(vec![item(), item()]);
        let transformed = TimeGradTransformation::new(2, 2, 0).apply(dataset, false);

        assert_eq!(transformed.len(), 2);
        assert_eq!(transformed.get(1).map(|e| e.time_feat_length()), Some(5));
        assert!(transformed.get(2).is_none());
    }
}
