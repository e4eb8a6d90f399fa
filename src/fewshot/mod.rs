//! Few-shot evaluation protocol.
//!
//! Episodes are drawn once per split, features are extracted once per epoch,
//! and every episode is then scored with a nearest-class-mean classifier
//! after the configured preprocessing.

pub mod episodes;
pub mod ncm;
pub mod preprocess;
pub mod tracker;

pub use episodes::{define_runs, EpisodeConfig, EpisodeSet};
pub use ncm::{classify, Accuracy, Distance};
pub use preprocess::{Pipeline, Stage};
pub use tracker::{MetaTracker, Rank, Setting};

use crate::dataset::FewShotInfo;
use crate::error::{Error, Result};
use crate::features::FeatureBank;
use ndarray::prelude::*;
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

/// Episodes of the validation and novel splits, drawn once per process.
#[derive(Debug, Clone)]
pub struct SplitEpisodes {
    pub val: EpisodeSet,
    pub novel: EpisodeSet,
}

impl SplitEpisodes {
    pub fn define<R: Rng + ?Sized>(
        info: &FewShotInfo,
        config: &EpisodeConfig,
        rng: &mut R,
    ) -> Result<SplitEpisodes> {
        let val = define_runs(config, &info.elements_val, rng)?;
        let novel = define_runs(config, &info.elements_novel, rng)?;
        debug!(
            runs = config.n_runs,
            ways = config.n_ways,
            per_class = config.per_class(),
            "few-shot episodes defined"
        );
        Ok(SplitEpisodes { val, novel })
    }
}

/// Everything needed to score a feature bank, except the bank itself.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub pipeline: Pipeline,
    pub distance: Distance,
}

impl Protocol {
    /// Gather, preprocess and score one episode for a `shots`-shot task.
    pub fn score_episode(
        &self,
        bank: &FeatureBank,
        episodes: &EpisodeSet,
        run: usize,
        shots: usize,
        base_mean: Option<ArrayView1<f32>>,
    ) -> Accuracy {
        let dim = bank.dim();
        let n_ways = episodes.n_ways;
        let mut support = Array3::<f32>::zeros((n_ways, shots, dim));
        let mut queries = Array3::<f32>::zeros((n_ways, episodes.n_queries, dim));

        for (way, &class) in episodes.classes[run].iter().enumerate() {
            let features = &bank.classes[class];
            for (i, &e) in episodes.support(run, way, shots).iter().enumerate() {
                support.slice_mut(s![way, i, ..]).assign(&features.row(e));
            }
            for (i, &e) in episodes.queries(run, way).iter().enumerate() {
                queries.slice_mut(s![way, i, ..]).assign(&features.row(e));
            }
        }

        self.pipeline.apply(&mut support, &mut queries, base_mean);
        classify(support.view(), queries.view(), self.distance)
    }

    /// Mean accuracy over every episode of the split.
    pub fn evaluate(
        &self,
        bank: &FeatureBank,
        episodes: &EpisodeSet,
        shots: usize,
        base_mean: Option<ArrayView1<f32>>,
    ) -> Result<Accuracy> {
        check_compatible(bank, episodes, shots)?;
        if episodes.is_empty() {
            return Ok(Accuracy::default());
        }

        // Scored in parallel, summed in episode order.
        let scores: Vec<Accuracy> = (0..episodes.len())
            .into_par_iter()
            .map(|run| self.score_episode(bank, episodes, run, shots, base_mean))
            .collect();

        let n = scores.len() as f64;
        let (top1, top5) = scores
            .iter()
            .fold((0.0, 0.0), |(t1, t5), a| (t1 + a.top1, t5 + a.top5));
        Ok(Accuracy {
            top1: top1 / n,
            top5: top5 / n,
        })
    }
}

fn check_compatible(bank: &FeatureBank, episodes: &EpisodeSet, shots: usize) -> Result<()> {
    if shots == 0 || shots > episodes.max_shots {
        return Err(Error::Config(format!(
            "{shots}-shot evaluation on episodes drawn for at most {} shots",
            episodes.max_shots
        )));
    }
    bank.check_dim()?;
    let elements = bank.elements_per_class();
    for (run, classes) in episodes.classes.iter().enumerate() {
        for (way, &class) in classes.iter().enumerate() {
            let available = *elements.get(class).ok_or_else(|| {
                Error::Dataset(format!(
                    "episode {run} uses class {class}, the features only hold {} classes",
                    elements.len()
                ))
            })?;
            if let Some(&e) = episodes.indices[run][way].iter().find(|&&e| e >= available) {
                return Err(Error::Dataset(format!(
                    "episode {run} uses element {e} of class {class}, which has {available}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn separable_bank(n_classes: usize, per_class: usize) -> FeatureBank {
        FeatureBank {
            classes: (0..n_classes)
                .map(|c| {
                    Array2::from_shape_fn((per_class, 3), |(e, d)| {
                        let center = if d == c % 3 { 10.0 * (1 + c / 3) as f32 } else { 0.0 };
                        center + 0.01 * ((e * 7 + d) % 5) as f32
                    })
                })
                .collect(),
        }
    }

    fn episodes(n_classes: usize, per_class: usize) -> EpisodeSet {
        let config = EpisodeConfig {
            n_ways: 5,
            max_shots: 5,
            n_queries: 15,
            n_runs: 50,
        };
        define_runs(&config, &vec![per_class; n_classes], &mut ChaCha8Rng::seed_from_u64(11)).unwrap()
    }

    #[test]
    fn separable_features_score_perfectly() {
        let bank = separable_bank(9, 25);
        let eps = episodes(9, 25);
        let protocol = Protocol {
            pipeline: "".parse().unwrap(),
            distance: Distance::Euclidean,
        };
        for shots in [1, 5] {
            let acc = protocol.evaluate(&bank, &eps, shots, None).unwrap();
            assert_eq!(acc.top1, 1.0);
            assert_eq!(acc.top5, 1.0);
        }
    }

    #[test]
    fn evaluation_is_repeatable() {
        let bank = separable_bank(9, 25);
        let eps = episodes(9, 25);
        let protocol = Protocol {
            pipeline: "PEME".parse().unwrap(),
            distance: Distance::Cosine,
        };
        let a = protocol.evaluate(&bank, &eps, 1, None).unwrap();
        let b = protocol.evaluate(&bank, &eps, 1, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn split_episodes_follow_class_counts() {
        let info = FewShotInfo {
            base_classes: 4,
            val_classes: 5,
            novel_classes: 7,
            elements_val: vec![20; 5],
            elements_novel: vec![20; 7],
        };
        let config = EpisodeConfig {
            n_ways: 5,
            max_shots: 1,
            n_queries: 3,
            n_runs: 8,
        };
        let splits = SplitEpisodes::define(&info, &config, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!((splits.val.len(), splits.novel.len()), (8, 8));
        assert!(splits.novel.classes.iter().flatten().all(|&c| c < 7));

        let short = FewShotInfo {
            elements_novel: vec![20, 20, 20, 20, 2, 20, 20],
            ..info
        };
        assert!(matches!(
            SplitEpisodes::define(&short, &config, &mut ChaCha8Rng::seed_from_u64(0)),
            Err(Error::InsufficientElements { .. })
        ));
    }

    #[test]
    fn mismatched_bank_is_rejected() {
        let bank = separable_bank(6, 25);
        let eps = episodes(9, 25);
        let protocol = Protocol {
            pipeline: Pipeline::default(),
            distance: Distance::Euclidean,
        };
        assert!(protocol.evaluate(&bank, &eps, 1, None).is_err());
        let bank = separable_bank(9, 25);
        assert!(protocol.evaluate(&bank, &eps, 6, None).is_err());

        let mut uneven = separable_bank(9, 25);
        uneven.classes[3] = Array2::ones((25, 4));
        assert!(matches!(
            protocol.evaluate(&uneven, &eps, 1, None),
            Err(Error::Dataset(_))
        ));
    }
}
