use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rank {
    Top1,
    Top5,
}

/// A tracked evaluation setting: shot count and accuracy rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Setting {
    pub shots: usize,
    pub rank: Rank,
}

impl Setting {
    pub fn new(shots: usize, rank: Rank) -> Setting {
        Setting { shots, rank }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rank = match self.rank {
            Rank::Top1 => 1,
            Rank::Top5 => 5,
        };
        write!(f, "{}shot_top{}", self.shots, rank)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Best {
    pub val: f64,
    pub novel: f64,
    pub epoch: usize,
}

/// Best-epoch bookkeeping for one training run.
///
/// Validation accuracy decides which epoch's novel accuracy is kept: the
/// novel value of a setting is only overwritten in an epoch where that
/// setting's validation accuracy beats its best so far.
#[derive(Debug, Clone, Default)]
pub struct MetaTracker {
    best: BTreeMap<Setting, Best>,
}

impl MetaTracker {
    pub fn new() -> MetaTracker {
        MetaTracker::default()
    }

    /// Record one epoch's accuracies for `setting`. Returns true when the
    /// stored best moved to this epoch.
    pub fn update(&mut self, setting: Setting, epoch: usize, val: f64, novel: f64) -> bool {
        match self.best.get_mut(&setting) {
            Some(best) if val <= best.val => false,
            Some(best) => {
                *best = Best { val, novel, epoch };
                true
            }
            None => {
                self.best.insert(setting, Best { val, novel, epoch });
                true
            }
        }
    }

    pub fn best(&self, setting: Setting) -> Option<Best> {
        self.best.get(&setting).copied()
    }

    /// Reported novel accuracy per setting, keyed by the setting's name.
    pub fn summary(&self) -> BTreeMap<String, f64> {
        self.best
            .iter()
            .map(|(s, b)| (format!("best_novel_{s}"), b.novel))
            .collect()
    }
}
