use crate::dataset::{ClassInfo, DatasetBundle, FewShotInfo, ImageSet};
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const SIDE: usize = 8;
const BASE_CLASSES: usize = 16;
const VAL_CLASSES: usize = 8;
const NOVEL_CLASSES: usize = 8;
const ELEMENTS: usize = 40;
const NOISE: f32 = 0.5;

/// Few-shot dataset of Gaussian clusters, one random 1x8x8 center per class.
///
/// Fully determined by `seed`; needs no files.
pub fn load(seed: u64) -> DatasetBundle {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let train = clusters(BASE_CLASSES, &mut rng);
    let val = clusters(VAL_CLASSES, &mut rng);
    let test = clusters(NOVEL_CLASSES, &mut rng);
    DatasetBundle {
        train,
        val: Some(val),
        test,
        input_shape: (1, SIDE, SIDE),
        classes: ClassInfo::FewShot(FewShotInfo {
            base_classes: BASE_CLASSES,
            val_classes: VAL_CLASSES,
            novel_classes: NOVEL_CLASSES,
            elements_val: vec![ELEMENTS; VAL_CLASSES],
            elements_novel: vec![ELEMENTS; NOVEL_CLASSES],
        }),
        top5: false,
    }
}

fn clusters(n_classes: usize, rng: &mut ChaCha8Rng) -> ImageSet {
    let unit = Normal::new(0.0, 1.0).expect("valid normal parameters");
    let noise = Normal::new(0.0, NOISE).expect("valid normal parameters");
    let centers = Array4::<f32>::random_using((n_classes, 1, SIDE, SIDE), unit, rng);
    let mut images = Array4::<f32>::random_using((n_classes * ELEMENTS, 1, SIDE, SIDE), noise, rng);
    let mut labels = Vec::with_capacity(n_classes * ELEMENTS);
    for class in 0..n_classes {
        let rows = class * ELEMENTS..(class + 1) * ELEMENTS;
        let mut block = images.slice_mut(s![rows, .., .., ..]);
        block += &centers.slice(s![class..class + 1, .., .., ..]);
        labels.extend(std::iter::repeat(class).take(ELEMENTS));
    }
    ImageSet { images, labels }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_data() {
        let a = load(3);
        let b = load(3);
        assert_eq!(a.train, b.train);
        assert_eq!(a.test, b.test);
        assert_ne!(a.train, load(4).train);
    }

    #[test]
    fn split_sizes_match_metadata() {
        let bundle = load(0);
        let info = bundle.few_shot().unwrap();
        assert_eq!(bundle.train.len(), BASE_CLASSES * ELEMENTS);
        assert_eq!(bundle.val.as_ref().unwrap().class_counts(info.val_classes), info.elements_val);
        assert_eq!(bundle.test.class_counts(info.novel_classes), info.elements_novel);
    }
}
