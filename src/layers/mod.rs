pub use crate::layers::activations::{ReluLayer, SoftMaxLayer};
pub use crate::layers::conv::{Conv2Dlayer, FlattenLayer, MaxPoolLayer};
pub use crate::layers::fc::FcLayer;
pub use crate::model::Module;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
pub mod activations;
pub mod conv;
pub mod fc;

/// A trainable tensor together with the gradient of its last backward pass.
///
/// `grad` is `None` when no backward pass happened since the last `zero_grad`.
pub struct Param<'a> {
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: Option<ArrayViewD<'a, f32>>,
}

/// Backbone building block. Output heads hold their softmax separately.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Layer {
    FC(FcLayer),
    Conv(Conv2Dlayer),
    Pool(MaxPoolLayer),
    ReLU(ReluLayer),
    Flatten(FlattenLayer),
}

impl Module for Layer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.forward(input),
            Layer::Conv(l) => l.forward(input),
            Layer::Pool(l) => l.forward(input),
            Layer::ReLU(l) => l.forward(input),
            Layer::Flatten(l) => l.forward(input),
        }
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.backward(dz),
            Layer::Conv(l) => l.backward(dz),
            Layer::Pool(l) => l.backward(dz),
            Layer::ReLU(l) => l.backward(dz),
            Layer::Flatten(l) => l.backward(dz),
        }
    }

    fn zero_grad(&mut self) {
        match self {
            Layer::FC(l) => l.zero_grad(),
            Layer::Conv(l) => l.zero_grad(),
            Layer::Pool(l) => l.zero_grad(),
            Layer::ReLU(l) => l.zero_grad(),
            Layer::Flatten(l) => l.zero_grad(),
        }
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        match self {
            Layer::FC(l) => l.parameters(),
            Layer::Conv(l) => l.parameters(),
            _ => Vec::new(), // no weights in other layers
        }
    }
}
