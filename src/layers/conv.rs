use crate::layers::Param;
use crate::model::Module;
use ndarray::prelude::*;
use ndarray::Zip;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32;

/// 2D convolution layer (no padding, stride 1), computed with 'img2col'.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv2Dlayer {
    in_channels: usize,
    out_channels: usize,
    kernel_size: (usize, usize),
    // weights
    pub kernels_mat: Array2<f32>, // Layout for img2col: (out_channels, in_channels*k^2)
    pub b: Array1<f32>,           // One bias per output channel: (output_channels)
    // for backprop
    #[serde(skip)]
    last_input: Option<Array3<f32>>, // patches matrices: (batch_size, locations, in_channels * k^2)
    //
    #[serde(skip)]
    pub k_grad: Option<Array2<f32>>, // (out_channels, in_channels*k^2)
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>, // (out_channels)
}

impl Conv2Dlayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        rng: &mut R,
    ) -> Conv2Dlayer {
        assert!(kernel_size.0 == kernel_size.1);
        let k = kernel_size.0;
        let scale = (6.0 / (in_channels * k * k) as f32).sqrt(); // uniform He init
        Conv2Dlayer {
            in_channels,
            out_channels,
            kernel_size,
            kernels_mat: Array2::random_using(
                (out_channels, in_channels * k * k),
                Uniform::new(-1.0, 1.0),
                rng,
            ) * scale,
            b: Array1::zeros(out_channels),
            last_input: None,
            k_grad: None,
            b_grad: None,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Spatial size of the output for an input of size `(h, w)`.
    pub fn output_size(&self, (h, w): (usize, usize)) -> (usize, usize) {
        let k = self.kernel_size.0;
        (h + 1 - k, w + 1 - k)
    }
}

impl Module for Conv2Dlayer {
    /// OUT = kernels_mat x patches_mat^T, one batch item at a time.
    ///
    /// - kernels_mat: (out_channels, in_channels * k^2)
    /// - patches_mat: (locations, in_channels * k^2), one row per kernel position
    ///
    /// Input: (batch_size, in_channels, height, width)
    /// Output: (batch_size, out_channels, height-k+1, width-k+1)
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("Conv layer input should be 4D");

        let (batch_size, in_channels, in_height, in_width) = input.dim();
        assert!(in_channels == self.in_channels);
        let k = self.kernel_size.0;
        let (out_height, out_width) = self.output_size((in_height, in_width));
        let nb_locations = out_height * out_width;
        let patch_len = in_channels * k * k;

        let mut out = Array4::zeros((batch_size, self.out_channels, out_height, out_width));
        let mut last_input = Array3::<f32>::zeros((batch_size, nb_locations, patch_len));

        for (batch_idx, feature_maps) in input.outer_iter().enumerate() {
            let mut patches_mat = last_input.index_axis_mut(Axis(0), batch_idx);
            // windows are yielded in row-major location order
            for (mut row, patch) in patches_mat
                .rows_mut()
                .into_iter()
                .zip(feature_maps.windows((in_channels, k, k)))
            {
                row.assign(&patch.flatten());
            }

            // (out_channels, L) = (out_channels, in_channels*k^2) dot (L, in_channels*k^2)^T
            let mut flat_out = self.kernels_mat.dot(&patches_mat.t());
            flat_out += &self.b.view().insert_axis(Axis(1));

            let out_maps = flat_out
                .into_shape_with_order((self.out_channels, out_height, out_width))
                .expect("(out_channels, L) reshapes to (out_channels, out_height, out_width)");
            out.index_axis_mut(Axis(0), batch_idx).assign(&out_maps);
        }

        self.last_input = Some(last_input);
        out.into_dyn()
    }

    /// Gradients, with dz reshaped to (out_channels, locations) per batch item:
    /// - dL/dkernels_mat = sum over batch of dz dot patches_mat
    /// - dL/dbias = dz summed over locations and batch
    /// - dL/dpatches_mat = kernels_mat^T dot dz, scattered back (+=) onto the
    ///   input window each patch was read from.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [conv] incoming dz is 4D");
        let (batch_size, out_channels, out_height, out_width) = dz.dim();
        let nb_locations = out_height * out_width;
        let k = self.kernel_size.0;

        let dz = dz
            .to_shape((batch_size, out_channels, nb_locations))
            .expect("[backward] [conv] incoming dz is compatible with img2col shape");

        let patches = self
            .last_input
            .take()
            .expect("Run forward before the backward");

        let mut dkernels: Array2<f32> = Array2::zeros((out_channels, self.in_channels * k * k));
        for batch_idx in 0..batch_size {
            dkernels += &dz
                .index_axis(Axis(0), batch_idx)
                .dot(&patches.index_axis(Axis(0), batch_idx));
        }
        self.k_grad = Some(dkernels);
        self.b_grad = Some(dz.sum_axis(Axis(2)).sum_axis(Axis(0)));

        let height = out_height + k - 1;
        let width = out_width + k - 1;
        let mut dinput = Array4::zeros((batch_size, self.in_channels, height, width));
        for batch_idx in 0..batch_size {
            // (in_channels*k^2, locations)
            let dpatches = self.kernels_mat.t().dot(&dz.index_axis(Axis(0), batch_idx));
            for (loc, patch_grad) in dpatches.columns().into_iter().enumerate() {
                let top_y = loc / out_width;
                let top_x = loc % out_width;
                let patch_grad = patch_grad
                    .to_shape((self.in_channels, k, k))
                    .expect("patch gradient reshapes to (in_channels, k, k)");
                let mut window =
                    dinput.slice_mut(s![batch_idx, .., top_y..top_y + k, top_x..top_x + k]);
                window += &patch_grad;
            }
        }

        dinput.into_dyn()
    }

    fn zero_grad(&mut self) {
        self.k_grad = None;
        self.b_grad = None;
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        let Conv2Dlayer {
            kernels_mat,
            b,
            k_grad,
            b_grad,
            ..
        } = self;
        vec![
            Param {
                value: kernels_mat.view_mut().into_dyn(),
                grad: k_grad.as_ref().map(|g| g.view().into_dyn()),
            },
            Param {
                value: b.view_mut().into_dyn(),
                grad: b_grad.as_ref().map(|g| g.view().into_dyn()),
            },
        ]
    }
}

/// Non-overlapping max pooling. Trailing rows/columns that do not fill a
/// whole window are dropped (and get zero gradient).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MaxPoolLayer {
    pool_size: (usize, usize),
    // for backprop
    #[serde(skip)]
    last_input_max_mask: Option<Array6<f32>>, // (batch_size, in_channels, height/k, k, width/k, k)
    #[serde(skip)]
    last_input_dim: Option<(usize, usize, usize, usize)>,
}

impl MaxPoolLayer {
    pub fn new(pool_size: (usize, usize)) -> MaxPoolLayer {
        assert!(pool_size.0 == pool_size.1);
        MaxPoolLayer {
            pool_size,
            last_input_max_mask: None,
            last_input_dim: None,
        }
    }

    pub fn output_size(&self, (h, w): (usize, usize)) -> (usize, usize) {
        (h / self.pool_size.0, w / self.pool_size.0)
    }
}

impl Module for MaxPoolLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("[forward] [maxPool] input is a 4D tensor");

        let (batch_size, in_channels, height, width) = input.dim();
        let k = self.pool_size.0;
        let (oh, ow) = self.output_size((height, width));

        let cropped = input.slice(s![.., .., ..oh * k, ..ow * k]);
        let input_6d = cropped
            .to_shape((batch_size, in_channels, oh, k, ow, k))
            .expect("[forward] [maxPool] input is compatible with 6D tensor for the pooling");

        // Fold the dims with size k, i.e axis 3 and then (former) axis 5
        let pooled: Array4<f32> = input_6d
            .fold_axis(Axis(3), f32::NEG_INFINITY, |&a, &b| a.max(b))
            .fold_axis(Axis(4), f32::NEG_INFINITY, |&a, &b| a.max(b));

        // Mask of the max positions, for backprop
        let pooled_6d = pooled
            .to_shape((batch_size, in_channels, oh, 1, ow, 1))
            .expect("[forward] [maxPool] pooled output reshapes to 6D");
        let mut mask = Array6::<f32>::zeros((batch_size, in_channels, oh, k, ow, k));
        Zip::from(&mut mask)
            .and(&input_6d)
            .and_broadcast(&pooled_6d)
            .for_each(|m, &in_val, &max_val| {
                // NOTE: ties all receive the gradient
                if in_val == max_val {
                    *m = 1.0
                }
            });

        self.last_input_max_mask = Some(mask);
        self.last_input_dim = Some((batch_size, in_channels, height, width));

        pooled.into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        // dz: (batch_size, channels, height/k, width/k)
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [maxPool] dz is 4D");
        let (batch_size, channels, out_height, out_width) = dz.dim();
        let k = self.pool_size.0;

        let dz_6d = dz
            .to_shape((batch_size, channels, out_height, 1, out_width, 1))
            .expect("[backward] [maxPool] dz reshapes to 6D");
        let mask = self
            .last_input_max_mask
            .take()
            .expect("[backward] [maxPool] Run forward before backward");
        let (_, _, height, width) = self
            .last_input_dim
            .take()
            .expect("[backward] [maxPool] Run forward before backward");

        let dpooled = (mask * &dz_6d)
            .into_shape_with_order((batch_size, channels, out_height * k, out_width * k))
            .expect("[backward] [maxPool] gradient is compatible with expected 4D tensor");

        let mut dinput = Array4::zeros((batch_size, channels, height, width));
        dinput
            .slice_mut(s![.., .., ..out_height * k, ..out_width * k])
            .assign(&dpooled);
        dinput.into_dyn()
    }

    fn zero_grad(&mut self) {
        self.last_input_max_mask = None;
        self.last_input_dim = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FlattenLayer {
    #[serde(skip)]
    last_shape: Option<Vec<usize>>,
}

impl FlattenLayer {
    pub fn new() -> FlattenLayer {
        FlattenLayer { last_shape: None }
    }
}

impl Module for FlattenLayer {
    /// (batch_size, ...) --> (batch_size, features)
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let shape = input.shape().to_vec();
        let batch_size = shape[0];
        let features = shape[1..].iter().product::<usize>();
        self.last_shape = Some(shape);
        input
            .to_shape((batch_size, features))
            .expect("flatten input to 2D array should not fail")
            .to_owned()
            .into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let shape = self
            .last_shape
            .take()
            .expect("Need to do a forward pass before the backward");
        dz.to_shape(shape)
            .expect("should be able to reshape the incoming gradient")
            .to_owned()
    }

    fn zero_grad(&mut self) {
        self.last_shape = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn conv_output_shape_handles_rectangular_inputs() {
        let mut conv = Conv2Dlayer::new(2, 3, (3, 3), &mut ChaCha8Rng::seed_from_u64(0));
        let out = conv.forward(Array4::<f32>::ones((4, 2, 7, 5)).into_dyn());
        assert_eq!(out.shape(), &[4, 3, 5, 3]);
        let dx = conv.backward(Array4::<f32>::ones((4, 3, 5, 3)).into_dyn());
        assert_eq!(dx.shape(), &[4, 2, 7, 5]);
        assert_eq!(conv.k_grad.as_ref().unwrap().dim(), (3, 18));
    }

    #[test]
    fn conv_matches_direct_sum() {
        let mut conv = Conv2Dlayer::new(1, 1, (2, 2), &mut ChaCha8Rng::seed_from_u64(0));
        conv.kernels_mat = array![[1.0, 2.0, 3.0, 4.0]];
        conv.b = array![0.5];
        let input = array![[[[1.0, 0.0, 2.0], [0.0, 1.0, 0.0], [3.0, 0.0, 1.0]]]];
        let out = conv.forward(input.into_dyn());
        // top-left window [[1,0],[0,1]] -> 1 + 4 + 0.5
        assert_eq!(out[[0, 0, 0, 0]], 5.5);
        // bottom-right window [[1,0],[0,1]] -> 5.5 as well
        assert_eq!(out[[0, 0, 1, 1]], 5.5);
        // top-right window [[0,2],[1,0]] -> 4 + 3 + 0.5
        assert_eq!(out[[0, 0, 0, 1]], 7.5);
    }

    #[test]
    fn maxpool_routes_gradient_to_max_and_crops_odd_sizes() {
        let mut pool = MaxPoolLayer::new((2, 2));
        let input = array![[[[1.0, 5.0, 9.0], [2.0, 3.0, 9.0], [7.0, 7.0, 9.0]]]];
        let out = pool.forward(input.into_dyn());
        assert_eq!(out, array![[[[5.0]]]].into_dyn());
        let dx = pool.backward(array![[[[1.0]]]].into_dyn());
        assert_eq!(
            dx,
            array![[[[0.0, 1.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]]].into_dyn()
        );
    }

    #[test]
    fn flatten_roundtrips_shape() {
        let mut flat = FlattenLayer::new();
        let out = flat.forward(Array4::<f32>::zeros((2, 3, 4, 5)).into_dyn());
        assert_eq!(out.shape(), &[2, 60]);
        let back = flat.backward(out);
        assert_eq!(back.shape(), &[2, 3, 4, 5]);
    }
}
