use crate::dataset::{ClassInfo, DatasetBundle, ImageSet};
use crate::error::{Error, Result};
use mnist::MnistBuilder;
use ndarray::prelude::*;
use std::path::Path;

const TRAIN_LEN: usize = 60_000;
const TEST_LEN: usize = 10_000;
const SIDE: usize = 28;
const MEAN: f32 = 0.1307;
const STD: f32 = 0.3081;

const FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

/// Loads MNIST from the ubyte files under `dir` (nothing is downloaded).
pub fn load(dir: &Path) -> Result<DatasetBundle> {
    if let Some(missing) = FILES.iter().find(|f| !dir.join(f).is_file()) {
        return Err(Error::Dataset(format!(
            "MNIST file {missing} not found in {}",
            dir.display()
        )));
    }
    let base_path = format!("{}/", dir.display());
    let mnist = MnistBuilder::new()
        .base_path(&base_path)
        .training_set_length(TRAIN_LEN as u32)
        .test_set_length(TEST_LEN as u32)
        .finalize();

    Ok(DatasetBundle {
        train: to_image_set(&mnist.trn_img, &mnist.trn_lbl)?,
        val: None,
        test: to_image_set(&mnist.tst_img, &mnist.tst_lbl)?,
        input_shape: (1, SIDE, SIDE),
        classes: ClassInfo::Standard { num_classes: 10 },
        top5: false,
    })
}

/// 28x28 u8 pixels --> normalized (n, 1, 28, 28) floats.
fn to_image_set(pixels: &[u8], labels: &[u8]) -> Result<ImageSet> {
    let n = labels.len();
    let images = Array4::from_shape_vec(
        (n, 1, SIDE, SIDE),
        pixels
            .iter()
            .map(|&p| (p as f32 / 255.0 - MEAN) / STD)
            .collect(),
    )?;
    ImageSet::new(images, labels.iter().map(|&l| l as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixels_are_normalized() {
        let pixels = vec![0u8; SIDE * SIDE * 2];
        let set = to_image_set(&pixels, &[3, 7]).unwrap();
        assert_eq!(set.images.dim(), (2, 1, SIDE, SIDE));
        assert!((set.images[[0, 0, 0, 0]] + MEAN / STD).abs() < 1e-6);
        assert_eq!(set.labels, vec![3, 7]);
    }

    #[test]
    fn missing_files_are_reported() {
        let err = load(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.to_string().contains("train-images-idx3-ubyte"));
    }
}
