use crate::error::{Error, Result};
use ndarray::prelude::*;
use std::str::FromStr;

/// How a query is compared with the class prototypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    Euclidean,
    /// Negative cosine similarity.
    Cosine,
}

impl FromStr for Distance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Distance::Euclidean),
            "cosine" => Ok(Distance::Cosine),
            other => Err(Error::Config(format!(
                "unknown distance '{other}' (expected euclidean or cosine)"
            ))),
        }
    }
}

impl Distance {
    fn between(self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
        match self {
            Distance::Euclidean => {
                let diff = &a - &b;
                diff.dot(&diff).sqrt()
            }
            Distance::Cosine => {
                let denom = a.dot(&a).sqrt() * b.dot(&b).sqrt();
                if denom == 0.0 {
                    0.0
                } else {
                    -a.dot(&b) / denom
                }
            }
        }
    }
}

/// Top-1 / top-5 accuracy, as fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Accuracy {
    pub top1: f64,
    pub top5: f64,
}

/// One prototype per way: the mean of its support vectors.
///
/// `support`: (ways, shots, dim) --> (ways, dim)
pub fn prototypes(support: ArrayView3<f32>) -> Array2<f32> {
    support
        .mean_axis(Axis(1))
        .expect("every way has at least one support vector")
}

/// Nearest-class-mean scoring of one episode.
///
/// `support` is (ways, shots, dim) and `queries` is (ways, n_queries, dim);
/// the true class of a query is the way it is stored under. Top-1 takes the
/// first closest prototype. A query counts for top-5 when fewer than
/// `min(5, ways)` prototypes are strictly closer than its own class.
pub fn classify(support: ArrayView3<f32>, queries: ArrayView3<f32>, distance: Distance) -> Accuracy {
    let protos = prototypes(support);
    let n_ways = protos.nrows();
    let top_k = n_ways.min(5);

    let mut correct_1 = 0usize;
    let mut correct_5 = 0usize;
    let mut total = 0usize;
    for (true_class, way_queries) in queries.outer_iter().enumerate() {
        for query in way_queries.outer_iter() {
            let dists: Vec<f32> = protos
                .outer_iter()
                .map(|p| distance.between(query, p))
                .collect();

            let predicted = dists
                .iter()
                .enumerate()
                .fold((0, f32::INFINITY), |best, (i, &d)| if d < best.1 { (i, d) } else { best })
                .0;
            if predicted == true_class {
                correct_1 += 1;
            }

            let own = dists[true_class];
            let closer = dists.iter().filter(|&&d| d < own).count();
            if closer < top_k {
                correct_5 += 1;
            }
            total += 1;
        }
    }

    if total == 0 {
        return Accuracy::default();
    }
    Accuracy {
        top1: correct_1 as f64 / total as f64,
        top5: correct_5 as f64 / total as f64,
    }
}
