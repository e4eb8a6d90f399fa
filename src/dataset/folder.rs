use crate::dataset::{ClassInfo, DatasetBundle, DatasetOptions, FewShotInfo, ImageSet};
use crate::error::{Error, Result};
use image::imageops::FilterType;
use ndarray::prelude::*;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// Standard classification folders above this many classes also report top-5.
const TOP5_MIN_CLASSES: usize = 11;

/// `<root>/train/<class>/*` and `<root>/test/<class>/*`.
///
/// Class ids follow the sorted class directory names of `train`; `test` must
/// use the same names.
pub fn load_standard(root: &Path, options: &DatasetOptions) -> Result<DatasetBundle> {
    let train_classes = class_dirs(&root.join("train"))?;
    let test_classes = class_dirs(&root.join("test"))?;
    let names = |dirs: &[PathBuf]| -> Vec<String> {
        dirs.iter()
            .map(|d| d.file_name().unwrap_or_default().to_string_lossy().into_owned())
            .collect()
    };
    if names(&train_classes) != names(&test_classes) {
        return Err(Error::Dataset(format!(
            "train and test class folders differ under {}",
            root.display()
        )));
    }

    let num_classes = train_classes.len();
    Ok(DatasetBundle {
        train: load_split(&train_classes, options)?,
        val: None,
        test: load_split(&test_classes, options)?,
        input_shape: input_shape(options),
        classes: ClassInfo::Standard { num_classes },
        top5: num_classes >= TOP5_MIN_CLASSES,
    })
}

/// `<root>/base|val|novel/<class>/*`, each split labelled from 0.
pub fn load_few_shot(root: &Path, options: &DatasetOptions) -> Result<DatasetBundle> {
    let base = class_dirs(&root.join("base"))?;
    let val = class_dirs(&root.join("val"))?;
    let novel = class_dirs(&root.join("novel"))?;

    let val_set = load_split(&val, options)?;
    let novel_set = load_split(&novel, options)?;
    let info = FewShotInfo {
        base_classes: base.len(),
        val_classes: val.len(),
        novel_classes: novel.len(),
        elements_val: val_set.class_counts(val.len()),
        elements_novel: novel_set.class_counts(novel.len()),
    };

    Ok(DatasetBundle {
        train: load_split(&base, options)?,
        val: Some(val_set),
        test: novel_set,
        input_shape: input_shape(options),
        classes: ClassInfo::FewShot(info),
        top5: false,
    })
}

fn input_shape(options: &DatasetOptions) -> (usize, usize, usize) {
    let channels = if options.grayscale { 1 } else { 3 };
    (channels, options.image_size, options.image_size)
}

/// Sorted sub-directories of `dir`, one per class.
fn class_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::Dataset(format!("missing split folder {}", dir.display())));
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    if dirs.is_empty() {
        return Err(Error::Dataset(format!("no class folders in {}", dir.display())));
    }
    Ok(dirs)
}

fn load_split(class_dirs: &[PathBuf], options: &DatasetOptions) -> Result<ImageSet> {
    let mut samples: Vec<(PathBuf, usize)> = Vec::new();
    for (label, dir) in class_dirs.iter().enumerate() {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        samples.extend(files.into_iter().map(|p| (p, label)));
    }

    let (channels, h, w) = input_shape(options);
    let pixels = samples
        .par_iter()
        .map(|(path, _)| process_image(path, options.image_size as u32, options.grayscale))
        .collect::<Result<Vec<Vec<f32>>>>()?;

    let images = Array4::from_shape_vec((samples.len(), channels, h, w), pixels.concat())?;
    ImageSet::new(images, samples.into_iter().map(|(_, l)| l).collect())
}

/// Decode, resize to `size`x`size` and center the pixels on the image mean.
/// Output is channel-major: (channels, size, size) flattened.
pub fn process_image(path: &Path, size: u32, grayscale: bool) -> Result<Vec<f32>> {
    let img = image::open(path)?.resize_exact(size, size, FilterType::Triangle);
    let pixels = if grayscale {
        img.to_luma32f().into_raw()
    } else {
        // interleaved RGB --> planar
        let rgb = img.to_rgb32f().into_raw();
        let plane = (size * size) as usize;
        let mut planar = vec![0.0; rgb.len()];
        for (i, px) in rgb.chunks_exact(3).enumerate() {
            for c in 0..3 {
                planar[c * plane + i] = px[c];
            }
        }
        planar
    };
    let mean = pixels.iter().sum::<f32>() / pixels.len().max(1) as f32;
    Ok(pixels.into_iter().map(|p| p - mean).collect())
}
