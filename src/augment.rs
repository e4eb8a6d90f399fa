//! Batch-level augmentations: rotation self-supervision and mixup.

use ndarray::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;

/// Rotate each image of the batch by 90° counter-clockwise, in place.
/// Images must be square.
fn rotate_quarter(mut images: ArrayViewMut4<f32>) {
    // transpose (h, w), then flip rows
    let rotated = images
        .view()
        .permuted_axes([0, 1, 3, 2])
        .slice(s![.., .., ..;-1, ..])
        .to_owned();
    images.assign(&rotated);
}

/// Rotation self-supervision: the batch is cut in four quarters, rotated by
/// 0°, 90°, 180° and 270°. Returns the rotation label (0..4) of every sample.
pub fn rotate_batch(images: &mut Array4<f32>) -> Vec<usize> {
    let n = images.dim().0;
    let quarter = n / 4;
    let mut labels = vec![0; n];
    for (r, label) in labels.iter_mut().enumerate() {
        *label = if quarter == 0 { 0 } else { (r / quarter).min(3) };
    }
    if quarter == 0 {
        return labels;
    }
    // quarter k is rotated k times
    for start in [quarter, 2 * quarter, 3 * quarter] {
        rotate_quarter(images.slice_mut(s![start.., .., .., ..]));
    }
    labels
}

/// Mixup: blend the batch with a shuffled copy of itself.
///
/// `targets` are (batch_size, classes) distributions; they are mixed with the
/// same `lambda ~ U(0, 1)` and permutation.
pub fn mixup<R: Rng + ?Sized>(
    images: &mut Array4<f32>,
    targets: &mut [&mut Array2<f32>],
    rng: &mut R,
) {
    let n = images.dim().0;
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);
    let lambda: f32 = rng.gen();

    let shuffled = images.select(Axis(0), &perm);
    *images *= lambda;
    images.scaled_add(1.0 - lambda, &shuffled);
    for t in targets.iter_mut() {
        let shuffled = t.select(Axis(0), &perm);
        **t *= lambda;
        t.scaled_add(1.0 - lambda, &shuffled);
    }
}
