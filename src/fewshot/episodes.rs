use crate::error::{Error, Result};
use rand::seq::index;
use rand::Rng;

/// Shape of the episodes drawn for one evaluation split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeConfig {
    pub n_ways: usize,
    /// Largest shot count that will be evaluated on these episodes.
    pub max_shots: usize,
    pub n_queries: usize,
    pub n_runs: usize,
}

impl EpisodeConfig {
    /// Elements drawn per selected class.
    pub fn per_class(&self) -> usize {
        self.max_shots + self.n_queries
    }
}

/// A fixed list of episodes, generated once and reused for every epoch.
///
/// `classes[r]` holds the `n_ways` class ids of episode `r`, and
/// `indices[r][w]` the `max_shots + n_queries` element ids drawn for way `w`.
/// The first `max_shots` ids are the support pool, the last `n_queries` the
/// queries, so a `k`-shot evaluation for any `k <= max_shots` scores the same
/// queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeSet {
    pub n_ways: usize,
    pub max_shots: usize,
    pub n_queries: usize,
    pub classes: Vec<Vec<usize>>,
    pub indices: Vec<Vec<Vec<usize>>>,
}

impl EpisodeSet {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Support element ids of way `way` in episode `run` for a `shots`-shot task.
    pub fn support(&self, run: usize, way: usize, shots: usize) -> &[usize] {
        &self.indices[run][way][..shots]
    }

    pub fn queries(&self, run: usize, way: usize) -> &[usize] {
        &self.indices[run][way][self.max_shots..]
    }
}

/// Draw `config.n_runs` episodes from a pool of `elements.len()` classes.
///
/// Classes are drawn without replacement from the pool, element ids without
/// replacement within each class. Every class of the pool must hold at least
/// `max_shots + n_queries` elements, otherwise nothing is drawn.
pub fn define_runs<R: Rng + ?Sized>(
    config: &EpisodeConfig,
    elements: &[usize],
    rng: &mut R,
) -> Result<EpisodeSet> {
    let n_classes = elements.len();
    if config.n_ways == 0 || config.n_queries == 0 || config.max_shots == 0 {
        return Err(Error::Config(format!(
            "episodes need at least one way, shot and query (got {:?})",
            config
        )));
    }
    if config.n_ways > n_classes {
        return Err(Error::Config(format!(
            "cannot draw {} ways from a pool of {} classes",
            config.n_ways, n_classes
        )));
    }
    let needed = config.per_class();
    if let Some((class, &available)) = elements.iter().enumerate().find(|(_, &n)| n < needed) {
        return Err(Error::InsufficientElements {
            class,
            available,
            needed,
        });
    }

    let mut classes = Vec::with_capacity(config.n_runs);
    let mut indices = Vec::with_capacity(config.n_runs);
    for _ in 0..config.n_runs {
        let run_classes = index::sample(rng, n_classes, config.n_ways).into_vec();
        let run_indices = run_classes
            .iter()
            .map(|&c| index::sample(rng, elements[c], needed).into_vec())
            .collect();
        classes.push(run_classes);
        indices.push(run_indices);
    }

    Ok(EpisodeSet {
        n_ways: config.n_ways,
        max_shots: config.max_shots,
        n_queries: config.n_queries,
        classes,
        indices,
    })
}
