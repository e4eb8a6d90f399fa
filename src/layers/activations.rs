pub use crate::model::Module;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use std::f32;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReluLayer {
    #[serde(skip)]
    last_input: Option<ArrayD<f32>>,
}

impl ReluLayer {
    pub fn new() -> ReluLayer {
        ReluLayer { last_input: None }
    }
}

impl Module for ReluLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let out = input.mapv(|x| x.max(0.0));
        self.last_input = Some(input);
        out
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let mask = self
            .last_input
            .take()
            .expect("run forward before backward")
            .mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
        mask * dz
    }

    fn zero_grad(&mut self) {
        self.last_input = None;
    }
}

/// Softmax over the class axis, trained with cross-entropy.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SoftMaxLayer {
    #[serde(skip)]
    last_output: Option<Array2<f32>>,
}

impl SoftMaxLayer {
    pub fn new() -> SoftMaxLayer {
        SoftMaxLayer { last_output: None }
    }
}

impl Module for SoftMaxLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix2>()
            .expect("Input to sofmax should be 2D");

        let max = input.fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b));
        // exp(x - max)
        let mut out = input - max.insert_axis(Axis(1));
        out.mapv_inplace(|x| x.exp());

        let sum = out.sum_axis(Axis(1));
        let out = out / sum.insert_axis(Axis(1));

        // for backprop
        self.last_output = Some(out.clone());
        out.into_dyn()
    }

    /// NOTE: the incoming "gradient" is the (possibly soft) target distribution,
    /// (batch_size, K). With cross-entropy on top, dLoss/dlogits = (p - y) / batch_size.
    fn backward(&mut self, targets: ArrayD<f32>) -> ArrayD<f32> {
        let batch_size = targets.shape()[0];
        let probs = self
            .last_output
            .take()
            .expect("run forward before backward")
            .into_dyn();
        (probs - targets) / batch_size as f32
    }

    fn zero_grad(&mut self) {
        self.last_output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut sm = SoftMaxLayer::new();
        let out = sm.forward(array![[1.0, 2.0, 3.0], [1000.0, 1000.0, 1000.0]].into_dyn());
        for row in out.into_dimensionality::<Ix2>().unwrap().rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn softmax_backward_is_probs_minus_targets() {
        let mut sm = SoftMaxLayer::new();
        let probs = sm.forward(array![[0.0, 0.0]].into_dyn());
        let grad = sm.backward(array![[1.0, 0.0]].into_dyn());
        assert_eq!(probs, array![[0.5, 0.5]].into_dyn());
        assert_eq!(grad, array![[-0.5, 0.5]].into_dyn());
    }

    #[test]
    fn relu_masks_negative_inputs() {
        let mut relu = ReluLayer::new();
        let out = relu.forward(array![-1.0, 2.0].into_dyn());
        assert_eq!(out, array![0.0, 2.0].into_dyn());
        let dx = relu.backward(array![5.0, 5.0].into_dyn());
        assert_eq!(dx, array![0.0, 5.0].into_dyn());
    }
}
