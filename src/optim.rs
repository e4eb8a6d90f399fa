use crate::layers::Param;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

/// One-hot rows for `labels`: (batch_size, num_classes).
pub fn one_hot(labels: &[usize], num_classes: usize) -> Array2<f32> {
    let mut y = Array2::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        y[(i, label)] = 1.0;
    }
    y
}

/// Mean cross-entropy of softmax outputs `probs` against target
/// distributions `targets` (one-hot or mixed), both (batch_size, classes).
pub fn cross_entropy(targets: &Array2<f32>, probs: &Array2<f32>) -> f32 {
    let log_probs = probs.mapv(|p| (p + 1e-10).ln());
    let per_sample = -(targets * &log_probs).sum_axis(Axis(1));
    per_sample.mean().unwrap_or(0.0)
}

pub trait Optimizer {
    /// Run one optimization step over `params`.
    ///
    /// Assumes forward+backward have been done. `params` must come in the same
    /// order at every step, since per-parameter state is matched by position.
    fn step(&mut self, params: Vec<Param<'_>>);
    fn learning_rate(&self) -> f32;
    fn set_learning_rate(&mut self, lr: f32);
}

/// SGD with (optionally Nesterov) momentum and L2 weight decay.
pub struct SGDMomentum {
    pub learning_rate: f32,
    pub viscosity: f32,
    pub weight_decay: f32,
    pub nesterov: bool,
    velocity: Vec<Option<ArrayD<f32>>>, // one buffer per parameter
}

impl SGDMomentum {
    pub fn new(learning_rate: f32, viscosity: f32, weight_decay: f32, nesterov: bool) -> Self {
        SGDMomentum {
            learning_rate,
            viscosity,
            weight_decay,
            nesterov,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for SGDMomentum {
    fn step(&mut self, params: Vec<Param<'_>>) {
        if self.velocity.len() < params.len() {
            self.velocity.resize(params.len(), None);
        }
        for (mut param, velocity) in params.into_iter().zip(self.velocity.iter_mut()) {
            let Some(grad) = param.grad else { continue };
            // d = grad + wd * w
            let d = &grad + &(&param.value * self.weight_decay);
            // First step ever: the buffer starts at the gradient.
            let v = match velocity.take() {
                Some(v) => v * self.viscosity + &d,
                None => d.clone(),
            };
            let update = if self.nesterov {
                d + &(&v * self.viscosity)
            } else {
                v.clone()
            };
            param.value.scaled_add(-self.learning_rate, &update);
            *velocity = Some(v);
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

pub struct Adam {
    pub t: i32,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    states: Vec<Option<(ArrayD<f32>, ArrayD<f32>)>>, // (m, v) per parameter
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            t: 0,
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            states: Vec::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: Vec<Param<'_>>) {
        self.t += 1;
        let t = self.t as f32;
        if self.states.len() < params.len() {
            self.states.resize(params.len(), None);
        }
        for (mut param, state) in params.into_iter().zip(self.states.iter_mut()) {
            let Some(grad) = param.grad else { continue };
            let (m, v) = state.get_or_insert_with(|| {
                (ArrayD::zeros(grad.raw_dim()), ArrayD::zeros(grad.raw_dim()))
            });
            update_param(
                &mut param.value,
                &grad,
                m,
                v,
                self.learning_rate,
                (self.beta1, self.beta2),
                self.epsilon,
                t,
            );
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

#[allow(clippy::too_many_arguments)]
fn update_param(
    param: &mut ArrayViewMutD<f32>,
    grad: &ArrayViewD<f32>,
    m: &mut ArrayD<f32>,
    v: &mut ArrayD<f32>,
    lr: f32,
    (beta1, beta2): (f32, f32),
    eps: f32,
    t: f32,
) {
    // m = beta1 * m + (1 - beta1) * grad
    m.zip_mut_with(grad, |m_val, g_val| {
        *m_val = beta1 * *m_val + (1.0 - beta1) * g_val;
    });

    // v = beta2 * v + (1 - beta2) * grad^2
    v.zip_mut_with(grad, |v_val, g_val| {
        *v_val = beta2 * *v_val + (1.0 - beta2) * g_val.powi(2);
    });

    // Bias correction
    let m_corr = 1.0 - beta1.powf(t);
    let v_corr = 1.0 - beta2.powf(t);

    // w = w - lr * (m / m_corr) / (sqrt(v / v_corr) + eps)
    azip!((p in param, mv in &*m, vv in &*v) {
        let m_hat = mv / m_corr;
        let v_hat = vv / v_corr;
        *p -= lr * m_hat / (v_hat.sqrt() + eps);
    });
}

/// Multiply the base learning rate by `gamma` at every milestone epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLr {
    pub base_lr: f32,
    pub milestones: Vec<usize>,
    pub gamma: f32,
}

impl MultiStepLr {
    /// Learning rate for the epoch following `epochs_done` completed epochs.
    pub fn lr_at(&self, epochs_done: usize) -> f32 {
        let passed = self.milestones.iter().filter(|&&m| m <= epochs_done).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_param<'a>(value: &'a mut ArrayD<f32>, grad: &'a ArrayD<f32>) -> Vec<Param<'a>> {
        vec![Param {
            value: value.view_mut(),
            grad: Some(grad.view()),
        }]
    }

    #[test]
    fn cross_entropy_of_perfect_prediction_is_zero() {
        let y = one_hot(&[1, 0], 3);
        let p = array![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]];
        assert!(cross_entropy(&y, &p).abs() < 1e-6);
        let uniform = Array2::from_elem((2, 3), 1.0 / 3.0);
        assert!((cross_entropy(&y, &uniform) - 3f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn plain_sgd_step() {
        let mut opt = SGDMomentum::new(0.1, 0.0, 0.0, false);
        let mut w = array![1.0, -2.0].into_dyn();
        let g = array![0.5, 1.0].into_dyn();
        opt.step(single_param(&mut w, &g));
        assert!((w[[0]] - 0.95).abs() < 1e-6);
        assert!((w[[1]] + 2.1).abs() < 1e-6);
    }

    #[test]
    fn nesterov_momentum_accumulates() {
        let mut opt = SGDMomentum::new(1.0, 0.5, 0.0, true);
        let mut w = array![0.0].into_dyn();
        let g = array![1.0].into_dyn();
        // v1 = 1, update = g + 0.5 * v1 = 1.5
        opt.step(single_param(&mut w, &g));
        assert_eq!(w, array![-1.5].into_dyn());
        // v2 = 0.5 + 1 = 1.5, update = 1 + 0.75 = 1.75
        opt.step(single_param(&mut w, &g));
        assert_eq!(w, array![-3.25].into_dyn());
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut opt = SGDMomentum::new(0.1, 0.0, 0.5, false);
        let mut w = array![2.0].into_dyn();
        let g = array![0.0].into_dyn();
        opt.step(single_param(&mut w, &g));
        assert!((w[[0]] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        let mut opt = Adam::new(0.01);
        let mut w = array![1.0, 1.0].into_dyn();
        let g = array![3.0, -0.2].into_dyn();
        opt.step(single_param(&mut w, &g));
        assert!((w[[0]] - 0.99).abs() < 1e-5);
        assert!((w[[1]] - 1.01).abs() < 1e-5);
    }

    #[test]
    fn params_without_grad_are_skipped() {
        let mut opt = Adam::new(0.01);
        let mut w = array![1.0].into_dyn();
        opt.step(vec![Param {
            value: w.view_mut(),
            grad: None,
        }]);
        assert_eq!(w, array![1.0].into_dyn());
    }

    #[test]
    fn multistep_schedule() {
        let sched = MultiStepLr {
            base_lr: 0.1,
            milestones: vec![2, 4],
            gamma: 0.1,
        };
        assert_eq!(sched.lr_at(0), 0.1);
        assert_eq!(sched.lr_at(1), 0.1);
        assert!((sched.lr_at(2) - 0.01).abs() < 1e-9);
        assert!((sched.lr_at(5) - 0.001).abs() < 1e-9);
    }
}
