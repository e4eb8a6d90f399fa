use crate::dataset::ImageSet;
use crate::error::{Error, Result};
use crate::model::Classifier;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};

/// Features of an evaluation split, grouped by class.
///
/// `classes[c]` is the `(elements, dim)` matrix of class `c`, rows in the
/// order the elements appear in the split. Episodes index into these rows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeatureBank {
    pub classes: Vec<Array2<f32>>,
}

impl FeatureBank {
    pub fn dim(&self) -> usize {
        self.classes.first().map_or(0, |c| c.ncols())
    }

    /// Every class must share the dimension of the first one.
    pub fn check_dim(&self) -> Result<()> {
        let dim = self.dim();
        match self.classes.iter().position(|c| c.ncols() != dim) {
            Some(class) => Err(Error::Dataset(format!(
                "class {class} has {}-dimensional features, class 0 has {dim}",
                self.classes[class].ncols()
            ))),
            None => Ok(()),
        }
    }

    pub fn elements_per_class(&self) -> Vec<usize> {
        self.classes.iter().map(|c| c.nrows()).collect()
    }

    /// Group the rows of `features` by `labels` (`0..num_classes`).
    pub fn from_rows(features: ArrayView2<f32>, labels: &[usize], num_classes: usize) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(Error::Dataset(format!(
                "{} feature rows for {} labels",
                features.nrows(),
                labels.len()
            )));
        }
        let dim = features.ncols();
        let mut grouped: Vec<Vec<f32>> = vec![Vec::new(); num_classes];
        for (row, &label) in features.outer_iter().zip(labels) {
            let bucket = grouped.get_mut(label).ok_or_else(|| {
                Error::Dataset(format!("label {label} outside of {num_classes} classes"))
            })?;
            bucket.extend(row.iter());
        }
        let classes = grouped
            .into_iter()
            .map(|flat| Array2::from_shape_vec((flat.len() / dim.max(1), dim), flat))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(FeatureBank { classes })
    }

    /// Run `model` over `set` in batches and group the penultimate features by class.
    pub fn extract(
        model: &mut Classifier,
        set: &ImageSet,
        num_classes: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let mut rows = Array2::<f32>::zeros((set.len(), model.feature_dim()));
        for start in (0..set.len()).step_by(batch_size.max(1)) {
            let end = (start + batch_size).min(set.len());
            let (inputs, _) = set.batch(start, end);
            let output = model.forward(inputs.into_dyn());
            rows.slice_mut(s![start..end, ..]).assign(&output.features);
        }
        FeatureBank::from_rows(rows.view(), &set.labels, num_classes)
    }

    /// Mean of the class prototypes; used as centering reference.
    pub fn prototype_mean(&self) -> Array1<f32> {
        let mut sum = Array1::<f32>::zeros(self.dim());
        let mut count = 0;
        for class in &self.classes {
            if let Some(proto) = class.mean_axis(Axis(0)) {
                sum += &proto;
                count += 1;
            }
        }
        if count > 0 {
            sum /= count as f32;
        }
        sum
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn load(path: &str) -> Result<Self> {
        let file = BufReader::new(File::open(path)?);
        let bank: FeatureBank = serde_json::from_reader(file)?;
        bank.check_dim()?;
        Ok(bank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_grouped_in_order() {
        let rows = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [4.0, 4.0]];
        let labels = [1, 0, 1, 2, 1];
        let bank = FeatureBank::from_rows(rows.view(), &labels, 3).unwrap();
        assert_eq!(bank.elements_per_class(), vec![1, 3, 1]);
        assert_eq!(bank.classes[1], array![[0.0, 0.0], [2.0, 2.0], [4.0, 4.0]]);
        assert_eq!(bank.dim(), 2);
    }

    #[test]
    fn out_of_range_label_is_an_error() {
        let rows = array![[0.0], [1.0]];
        assert!(FeatureBank::from_rows(rows.view(), &[0, 5], 2).is_err());
    }

    #[test]
    fn prototype_mean_averages_class_means() {
        let bank = FeatureBank {
            classes: vec![array![[0.0, 2.0], [2.0, 2.0]], array![[5.0, 0.0]]],
        };
        assert_eq!(bank.prototype_mean(), array![3.0, 1.0]);
    }

    #[test]
    fn dump_with_uneven_dimensions_is_rejected() {
        let bank = FeatureBank {
            classes: vec![array![[0.5, 1.5]], array![[2.0, -1.0, 0.0]]],
        };
        assert!(matches!(bank.check_dim(), Err(Error::Dataset(_))));
        let path = std::env::temp_dir().join(format!("fsnet_bank_uneven_{}.json", std::process::id()));
        let path = path.to_str().unwrap();
        bank.save(path).unwrap();
        let loaded = FeatureBank::load(path);
        std::fs::remove_file(path).ok();
        assert!(matches!(loaded, Err(Error::Dataset(_))));
    }

    #[test]
    fn dump_roundtrip_through_file() {
        let bank = FeatureBank {
            classes: vec![array![[0.5, 1.5]], array![[2.0, -1.0], [3.0, 0.25]]],
        };
        let path = std::env::temp_dir().join(format!("fsnet_bank_{}.json", std::process::id()));
        let path = path.to_str().unwrap();
        bank.save(path).unwrap();
        let loaded = FeatureBank::load(path).unwrap();
        std::fs::remove_file(path).ok();
        assert_eq!(bank, loaded);
    }
}
