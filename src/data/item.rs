use burn::data::dataset::InMemDataset;
use serde::{Deserialize, Deserializer, Serialize};

/// One multivariate series as stored in JSON lines.
///
/// `target` and `observed_values` are laid out `[dim][time]`; `null` targets
/// are read as NaN.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MultivariateItem {
    pub item_id: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(deserialize_with = "nullable_rows")]
    pub target: Vec<Vec<f32>>,
    #[serde(default)]
    pub observed_values: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    pub feat_dynamic_real: Option<Vec<Vec<f32>>>,
}

impl MultivariateItem {
    pub fn new(item_id: impl Into<String>, target: Vec<Vec<f32>>) -> Self {
        Self {
            item_id: item_id.into(),
            start: None,
            target,
            observed_values: None,
            feat_dynamic_real: None,
        }
    }

    pub fn target_dim(&self) -> usize {
        self.target.len()
    }

    pub fn len(&self) -> usize {
        self.target.first().map_or(0, |row| row.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn nullable_rows<'de, D>(deserializer: D) -> Result<Vec<Vec<f32>>, D::Error>
where
    D: Deserializer<'de>,
{
    let rows: Vec<Vec<Option<f32>>> = Vec::deserialize(deserializer)?;
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().map(|v| v.unwrap_or(f32::NAN)).collect())
        .collect())
}

pub fn load_from_file(filename: &str) -> Result<InMemDataset<MultivariateItem>, std::io::Error> {
    InMemDataset::from_json_rows(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::data::dataset::Dataset;
    use std::io::Write;

    #[test]
    fn loads_json_rows_with_missing_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"item_id": "a", "target": [[1.0, null, 3.0], [4.0, 5.0, 6.0]]}}"#).unwrap();
        writeln!(
            file,
            r#"{{"item_id": "b", "start": "2021-01-01", "target": [[1.0], [2.0]], "feat_dynamic_real": [[0.5]]}}"#
        )
        .unwrap();

        let dataset = load_from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(dataset.len(), 2);
        let first = dataset.get(0).unwrap();
        assert_eq!(first.target_dim(), 2);
        assert_eq!(first.len(), 3);
        assert!(first.target[0][1].is_nan());
        assert_eq!(dataset.get(1).unwrap().feat_dynamic_real, Some(vec![vec![0.5]]));
    }
}
