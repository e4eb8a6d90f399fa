use crate::error::{Error, Result};
use ndarray::prelude::*;
use std::fmt;
use std::str::FromStr;

/// One stage of the feature preprocessing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `P`: `sign(x) * |x|^0.5`, elementwise.
    Power,
    /// `E`: center on the episode mean, then scale every vector to unit norm.
    Sphering,
    /// `M`: subtract the base-class mean, or the episode support mean.
    Centering,
}

impl Stage {
    fn letter(self) -> char {
        match self {
            Stage::Power => 'P',
            Stage::Sphering => 'E',
            Stage::Centering => 'M',
        }
    }
}

/// Ordered list of stages, parsed from a string such as `"PEME"`.
///
/// The pipeline holds no state between calls: everything a stage computes
/// comes from the episode it is applied to (plus the optional base mean).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl FromStr for Pipeline {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let stages = s
            .chars()
            .map(|c| match c {
                'P' => Ok(Stage::Power),
                'E' => Ok(Stage::Sphering),
                'M' => Ok(Stage::Centering),
                other => Err(Error::Config(format!(
                    "unknown preprocessing step '{other}' in \"{s}\" (expected P, E or M)"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Pipeline { stages })
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in &self.stages {
            write!(f, "{}", stage.letter())?;
        }
        Ok(())
    }
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Apply every stage in order to one episode.
    ///
    /// `support` is `(ways, shots, dim)`, `queries` is `(ways, queries, dim)`.
    pub fn apply(
        &self,
        support: &mut Array3<f32>,
        queries: &mut Array3<f32>,
        base_mean: Option<ArrayView1<f32>>,
    ) {
        for stage in &self.stages {
            match stage {
                Stage::Power => {
                    support.mapv_inplace(power);
                    queries.mapv_inplace(power);
                }
                Stage::Sphering => {
                    let mean = episode_mean(support, queries);
                    for set in [&mut *support, &mut *queries] {
                        *set -= &mean;
                        normalize_rows(set);
                    }
                }
                Stage::Centering => {
                    let mean = match base_mean {
                        Some(m) => m.to_owned(),
                        None => mean_vector(support),
                    };
                    *support -= &mean;
                    *queries -= &mean;
                }
            }
        }
    }
}

fn power(x: f32) -> f32 {
    x.signum() * x.abs().sqrt()
}

/// Mean over every vector of a `(ways, n, dim)` block.
fn mean_vector(set: &Array3<f32>) -> Array1<f32> {
    let dim = set.dim().2;
    let flat = set
        .to_shape((set.len() / dim.max(1), dim))
        .expect("contiguous (ways, n, dim) block flattens to (ways * n, dim)");
    flat.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(dim))
}

fn episode_mean(support: &Array3<f32>, queries: &Array3<f32>) -> Array1<f32> {
    let n_support = (support.dim().0 * support.dim().1) as f32;
    let n_queries = (queries.dim().0 * queries.dim().1) as f32;
    let total = n_support + n_queries;
    if total == 0.0 {
        return Array1::zeros(support.dim().2);
    }
    (mean_vector(support) * n_support + mean_vector(queries) * n_queries) / total
}

fn normalize_rows(set: &mut Array3<f32>) {
    for mut vector in set.lanes_mut(Axis(2)) {
        let norm = vector.dot(&vector).sqrt();
        if norm > 0.0 {
            vector /= norm;
        }
    }
}
