//! Dataset provider: image sets, class metadata and shuffled batches.

pub mod folder;
pub mod mnist;
pub mod synthetic;

use crate::error::{Error, Result};
use ndarray::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::PathBuf;
use tracing::info;

/// Images (n, channels, height, width) and their labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSet {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

impl ImageSet {
    pub fn new(images: Array4<f32>, labels: Vec<usize>) -> Result<Self> {
        if images.dim().0 != labels.len() {
            return Err(Error::Dataset(format!(
                "{} images for {} labels",
                images.dim().0,
                labels.len()
            )));
        }
        Ok(ImageSet { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Contiguous batch `[start, end)`.
    pub fn batch(&self, start: usize, end: usize) -> (Array4<f32>, Vec<usize>) {
        (
            self.images.slice(s![start..end, .., .., ..]).to_owned(),
            self.labels[start..end].to_vec(),
        )
    }

    /// Batch made of the given sample indices, in that order.
    pub fn gather(&self, indices: &[usize]) -> (Array4<f32>, Vec<usize>) {
        (
            self.images.select(Axis(0), indices),
            indices.iter().map(|&i| self.labels[i]).collect(),
        )
    }

    /// Number of samples of each label `0..num_classes`.
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for &l in &self.labels {
            if l < num_classes {
                counts[l] += 1;
            }
        }
        counts
    }

    /// Keep `n` samples chosen by a shuffle.
    pub fn subset<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> ImageSet {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        indices.truncate(n);
        let (images, labels) = self.gather(&indices);
        ImageSet { images, labels }
    }
}

/// Shuffled sample indices, cut into batches (the last one may be short).
pub fn shuffled_batches<R: Rng + ?Sized>(len: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    indices.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}

/// Class split of a few-shot dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FewShotInfo {
    pub base_classes: usize,
    pub val_classes: usize,
    pub novel_classes: usize,
    pub elements_val: Vec<usize>,
    pub elements_novel: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassInfo {
    Standard { num_classes: usize },
    FewShot(FewShotInfo),
}

/// Everything the training loop needs from a dataset.
///
/// For few-shot datasets `train` holds the base classes, `val` the validation
/// classes and `test` the novel classes, each labelled from 0.
#[derive(Debug, Clone)]
pub struct DatasetBundle {
    pub train: ImageSet,
    pub val: Option<ImageSet>,
    pub test: ImageSet,
    /// (channels, height, width)
    pub input_shape: (usize, usize, usize),
    pub classes: ClassInfo,
    pub top5: bool,
}

impl DatasetBundle {
    pub fn few_shot(&self) -> Option<&FewShotInfo> {
        match &self.classes {
            ClassInfo::FewShot(info) => Some(info),
            ClassInfo::Standard { .. } => None,
        }
    }

    /// Size of the classification head trained on `train`.
    pub fn num_classes(&self) -> usize {
        match &self.classes {
            ClassInfo::Standard { num_classes } => *num_classes,
            ClassInfo::FewShot(info) => info.base_classes,
        }
    }
}

/// Options shared by the dataset loaders.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub path: Option<PathBuf>,
    pub image_size: usize,
    pub grayscale: bool,
    /// Keep only this many training samples (standard datasets only).
    pub dataset_size: Option<usize>,
    pub seed: u64,
}

impl DatasetOptions {
    fn require_path(&self, dataset: &str) -> Result<&PathBuf> {
        let path = self.path.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "dataset '{dataset}' needs --dataset-path (or the DATASETS variable)"
            ))
        })?;
        if !path.is_dir() {
            return Err(Error::Dataset(format!(
                "dataset path {} is not a directory",
                path.display()
            )));
        }
        Ok(path)
    }
}

/// Load a dataset by name.
pub fn load_dataset<R: Rng + ?Sized>(
    name: &str,
    options: &DatasetOptions,
    rng: &mut R,
) -> Result<DatasetBundle> {
    let mut bundle = match name.to_lowercase().as_str() {
        "mnist" => mnist::load(options.require_path(name)?)?,
        "folder" => folder::load_standard(options.require_path(name)?, options)?,
        "folderfs" => folder::load_few_shot(options.require_path(name)?, options)?,
        "synthetic" => synthetic::load(options.seed),
        other => {
            return Err(Error::Config(format!(
                "unknown dataset '{other}' (expected mnist, folder, folderfs or synthetic)"
            )))
        }
    };

    if let Some(n) = options.dataset_size {
        if bundle.few_shot().is_some() {
            return Err(Error::Config(
                "--dataset-size only applies to standard classification".to_string(),
            ));
        }
        if n < bundle.train.len() {
            bundle.train = bundle.train.subset(n, rng);
        }
    }
    if bundle.train.is_empty() || bundle.test.is_empty() {
        return Err(Error::Dataset(format!("dataset '{name}' has an empty split")));
    }

    match &bundle.classes {
        ClassInfo::Standard { num_classes } => info!(
            train = bundle.train.len(),
            test = bundle.test.len(),
            classes = num_classes,
            "dataset {name} loaded"
        ),
        ClassInfo::FewShot(fs) => info!(
            "Dataset contains {} base classes, {} val classes and {} novel classes",
            fs.base_classes, fs.val_classes, fs.novel_classes
        ),
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn tiny_set() -> ImageSet {
        let images = Array4::from_shape_fn((6, 1, 2, 2), |(n, _, _, _)| n as f32);
        ImageSet::new(images, vec![0, 1, 2, 0, 1, 2]).unwrap()
    }

    #[test]
    fn gather_keeps_images_and_labels_aligned() {
        let set = tiny_set();
        let (images, labels) = set.gather(&[4, 1]);
        assert_eq!(labels, vec![1, 1]);
        assert_eq!(images[[0, 0, 0, 0]], 4.0);
        assert_eq!(images[[1, 0, 1, 1]], 1.0);
    }

    #[test]
    fn batches_cover_every_sample_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let batches = shuffled_batches(10, 4, &mut rng);
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
        let mut all: Vec<usize> = batches.concat();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn subset_and_counts() {
        let set = tiny_set();
        assert_eq!(set.class_counts(3), vec![2, 2, 2]);
        let sub = set.subset(4, &mut ChaCha8Rng::seed_from_u64(1));
        assert_eq!(sub.len(), 4);
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        assert!(ImageSet::new(Array4::zeros((2, 1, 1, 1)), vec![0]).is_err());
    }

    #[test]
    fn unknown_dataset_and_missing_path_fail_fast() {
        let options = DatasetOptions {
            path: None,
            image_size: 8,
            grayscale: true,
            dataset_size: None,
            seed: 0,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            load_dataset("imagenet", &options, &mut rng),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load_dataset("mnist", &options, &mut rng),
            Err(Error::Config(_))
        ));
        let options = DatasetOptions {
            path: Some(PathBuf::from("/definitely/not/here")),
            ..options
        };
        assert!(matches!(
            load_dataset("folderfs", &options, &mut rng),
            Err(Error::Dataset(_))
        ));
    }

    #[test]
    fn dataset_size_is_refused_for_few_shot() {
        let options = DatasetOptions {
            path: None,
            image_size: 8,
            grayscale: true,
            dataset_size: Some(10),
            seed: 0,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(load_dataset("synthetic", &options, &mut rng).is_err());
    }
}
