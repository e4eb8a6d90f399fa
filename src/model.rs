use crate::error::{Error, Result};
use crate::layers::{
    Conv2Dlayer, FcLayer, FlattenLayer, Layer, MaxPoolLayer, Param, ReluLayer, SoftMaxLayer,
};
use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32;

use std::fs::File;
use std::io::{Read, Write};

pub trait Module {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32>;
    /// Backward pass
    ///
    /// Receives dLoss/dz, where z is this module's output, and:
    /// - returns dLoss/dx = dz/dx * dLoss/dz, the same shape as the input;
    /// - stores dLoss/dw for the module's own weights, for the optimizer.
    ///
    /// The dz/dx Jacobian is never materialized: each layer computes the
    /// matrix-vector product directly.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32>;
    fn zero_grad(&mut self);
    /// Trainable tensors with their current gradients, in a stable order.
    fn parameters(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NN {
    pub layers: Vec<Layer>,
}

impl Module for NN {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = input;
        for layer in &mut self.layers {
            x = layer.forward(x);
        }
        x
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = dz;
        // Iterate layers in reverse order, mutate each as we go
        for layer in self.layers.iter_mut().rev() {
            x = layer.backward(x);
        }
        x
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        self.layers.iter_mut().flat_map(|l| l.parameters()).collect()
    }
}

/// Linear layer followed by a softmax.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Head {
    pub fc: FcLayer,
    pub softmax: SoftMaxLayer,
}

impl Head {
    fn new<R: Rng + ?Sized>(input_size: usize, classes: usize, rng: &mut R) -> Head {
        Head {
            fc: FcLayer::new(input_size, classes, rng),
            softmax: SoftMaxLayer::new(),
        }
    }

    fn forward(&mut self, features: ArrayD<f32>) -> Array2<f32> {
        let logits = self.fc.forward(features);
        self.softmax
            .forward(logits)
            .into_dimensionality::<Ix2>()
            .expect("softmax output is 2D")
    }

    /// `targets`: (batch_size, classes) distribution; `weight` scales this
    /// head's share of the loss. Returns dLoss/dfeatures.
    fn backward(&mut self, targets: &Array2<f32>, weight: f32) -> ArrayD<f32> {
        let dlogits = self.softmax.backward(targets.clone().into_dyn()) * weight;
        self.fc.backward(dlogits)
    }
}

/// Result of one forward pass through a [`Classifier`].
#[derive(Debug, Clone)]
pub struct Output {
    /// (batch_size, num_classes)
    pub probs: Array2<f32>,
    /// (batch_size, 4), only when the model has a rotation head.
    pub rotation_probs: Option<Array2<f32>>,
    /// Penultimate representation, (batch_size, feature_dim).
    pub features: Array2<f32>,
}

/// Feature extractor with a classification head and an optional
/// rotation-prediction head.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Classifier {
    pub name: String,
    pub backbone: NN,
    pub head: Head,
    pub rotation_head: Option<Head>,
    feature_dim: usize,
    /// (channels, height, width) the model was built for.
    input_shape: (usize, usize, usize),
}

impl Classifier {
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn input_shape(&self) -> (usize, usize, usize) {
        self.input_shape
    }

    pub fn num_classes(&self) -> usize {
        self.head.fc.output_size()
    }

    pub fn forward(&mut self, input: ArrayD<f32>) -> Output {
        let features = self
            .backbone
            .forward(input)
            .into_dimensionality::<Ix2>()
            .expect("backbone output is (batch_size, feature_dim)");
        let probs = self.head.forward(features.clone().into_dyn());
        let rotation_probs = self
            .rotation_head
            .as_mut()
            .map(|h| h.forward(features.clone().into_dyn()));
        Output {
            probs,
            rotation_probs,
            features,
        }
    }

    /// Backpropagate cross-entropy against `targets` (and `rotation_targets`
    /// when the rotation head is used; both heads then weigh 0.5).
    pub fn backward(&mut self, targets: &Array2<f32>, rotation_targets: Option<&Array2<f32>>) {
        let dfeatures = match (self.rotation_head.as_mut(), rotation_targets) {
            (Some(rot), Some(rot_targets)) => {
                self.head.backward(targets, 0.5) + rot.backward(rot_targets, 0.5)
            }
            _ => self.head.backward(targets, 1.0),
        };
        self.backbone.backward(dfeatures);
    }

    pub fn zero_grad(&mut self) {
        self.backbone.zero_grad();
        self.head.fc.zero_grad();
        self.head.softmax.zero_grad();
        if let Some(rot) = self.rotation_head.as_mut() {
            rot.fc.zero_grad();
            rot.softmax.zero_grad();
        }
    }

    pub fn parameters(&mut self) -> Vec<Param<'_>> {
        let Classifier {
            backbone,
            head,
            rotation_head,
            ..
        } = self;
        let mut params = backbone.parameters();
        params.extend(head.fc.parameters());
        if let Some(rot) = rotation_head {
            params.extend(rot.fc.parameters());
        }
        params
    }

    pub fn num_parameters(&mut self) -> usize {
        self.parameters().iter().map(|p| p.value.len()).sum()
    }

    /// Save the model to a JSON checkpoint file
    pub fn to_checkpoint(&self, filepath: &str) -> Result<()> {
        let json = serde_json::to_string(self)?;
        let mut file = File::create(filepath)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Load a model from a JSON checkpoint file
    pub fn from_checkpoint(filepath: &str) -> Result<Self> {
        let mut file = File::open(filepath)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Architecture selected by name on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// `mlp<N>`: N hidden layers of `feature_maps` units.
    Mlp(usize),
    /// `convnet`: two conv(3x3)/relu/maxpool(2) stages.
    ConvNet,
}

impl Architecture {
    pub fn parse(name: &str) -> Result<Architecture> {
        let lower = name.to_lowercase();
        if lower == "convnet" {
            return Ok(Architecture::ConvNet);
        }
        if let Some(depth) = lower.strip_prefix("mlp") {
            return depth
                .parse::<usize>()
                .map(Architecture::Mlp)
                .map_err(|_| Error::Config(format!("bad MLP depth in model name '{name}'")));
        }
        Err(Error::Config(format!(
            "unknown model '{name}' (expected mlp<N> or convnet)"
        )))
    }
}

/// Build a freshly initialized model.
///
/// `input_shape` is (channels, height, width).
pub fn create_model<R: Rng + ?Sized>(
    architecture: Architecture,
    feature_maps: usize,
    input_shape: (usize, usize, usize),
    num_classes: usize,
    rotations: bool,
    rng: &mut R,
) -> Result<Classifier> {
    let (channels, height, width) = input_shape;
    let mut layers = vec![];
    let feature_dim = match architecture {
        Architecture::Mlp(depth) => {
            layers.push(Layer::Flatten(FlattenLayer::new()));
            let mut size = channels * height * width;
            for _ in 0..depth {
                layers.push(Layer::FC(FcLayer::new(size, feature_maps, rng)));
                layers.push(Layer::ReLU(ReluLayer::new()));
                size = feature_maps;
            }
            size
        }
        Architecture::ConvNet => {
            let mut spatial = (height, width);
            let mut in_channels = channels;
            for out_channels in [feature_maps, 2 * feature_maps] {
                let conv = Conv2Dlayer::new(in_channels, out_channels, (3, 3), rng);
                let pool = MaxPoolLayer::new((2, 2));
                if spatial.0 < 4 || spatial.1 < 4 {
                    return Err(Error::Model(format!(
                        "input {height}x{width} is too small for convnet"
                    )));
                }
                spatial = pool.output_size(conv.output_size(spatial));
                layers.push(Layer::Conv(conv));
                layers.push(Layer::ReLU(ReluLayer::new()));
                layers.push(Layer::Pool(pool));
                in_channels = out_channels;
            }
            layers.push(Layer::Flatten(FlattenLayer::new()));
            in_channels * spatial.0 * spatial.1
        }
    };

    Ok(Classifier {
        name: format!("{architecture:?}"),
        backbone: NN { layers },
        head: Head::new(feature_dim, num_classes, rng),
        rotation_head: rotations.then(|| Head::new(feature_dim, 4, rng)),
        feature_dim,
        input_shape,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn parses_architecture_names() {
        assert_eq!(Architecture::parse("MLP2").unwrap(), Architecture::Mlp(2));
        assert_eq!(Architecture::parse("convnet").unwrap(), Architecture::ConvNet);
        assert!(Architecture::parse("mlpx").is_err());
        assert!(Architecture::parse("resnet18").is_err());
    }

    #[test]
    fn convnet_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut model =
            create_model(Architecture::ConvNet, 4, (1, 12, 12), 7, true, &mut rng).unwrap();
        // 12 -conv-> 10 -pool-> 5 -conv-> 3 -pool-> 1
        assert_eq!(model.feature_dim(), 8);
        let out = model.forward(Array4::<f32>::zeros((3, 1, 12, 12)).into_dyn());
        assert_eq!(out.probs.dim(), (3, 7));
        assert_eq!(out.features.dim(), (3, 8));
        assert_eq!(out.rotation_probs.unwrap().dim(), (3, 4));
    }

    #[test]
    fn every_parameter_gets_a_gradient() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut model = create_model(Architecture::Mlp(2), 6, (1, 3, 3), 4, true, &mut rng).unwrap();
        let out = model.forward(Array4::<f32>::ones((2, 1, 3, 3)).into_dyn());
        assert_eq!(out.probs.dim(), (2, 4));
        let targets = array![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        let rot_targets = array![[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]];
        model.backward(&targets, Some(&rot_targets));
        let params = model.parameters();
        // 2 hidden FC + head + rotation head, weights and biases each
        assert_eq!(params.len(), 8);
        assert!(params.iter().all(|p| p.grad.is_some()));
        drop(params);
        model.zero_grad();
        assert!(model.parameters().iter().all(|p| p.grad.is_none()));
    }

    #[test]
    fn checkpoint_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut model = create_model(Architecture::Mlp(1), 5, (1, 2, 2), 3, false, &mut rng).unwrap();
        let path = std::env::temp_dir().join(format!("fsnet_model_{}.json", std::process::id()));
        let path = path.to_str().unwrap();
        model.to_checkpoint(path).unwrap();
        let mut loaded = Classifier::from_checkpoint(path).unwrap();
        std::fs::remove_file(path).ok();

        let input = Array4::<f32>::from_elem((1, 1, 2, 2), 0.3).into_dyn();
        assert_eq!(model.forward(input.clone()).probs, loaded.forward(input).probs);
        assert_eq!(loaded.num_classes(), 3);
        assert_eq!(loaded.input_shape(), (1, 2, 2));
    }
}
