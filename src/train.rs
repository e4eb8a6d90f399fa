use crate::augment::{mixup, rotate_batch};
use crate::config::Config;
use crate::dataset::{shuffled_batches, DatasetBundle, FewShotInfo, ImageSet};
use crate::error::{Error, Result};
use crate::features::FeatureBank;
use crate::fewshot::{Accuracy, MetaTracker, Protocol, Rank, Setting, SplitEpisodes};
use crate::model::Classifier;
use crate::optim::{cross_entropy, one_hot, Adam, MultiStepLr, Optimizer, SGDMomentum};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, info};

const MOMENTUM: f32 = 0.9;
const WEIGHT_DECAY: f32 = 5e-4;

/// Loss and accuracies of a model on a labelled set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestStats {
    pub loss: f64,
    pub top1: f64,
    pub top5: f64,
}

/// Train `model` for one epoch over `set`. Returns the mean training loss.
pub fn train_epoch<R: Rng + ?Sized>(
    model: &mut Classifier,
    set: &ImageSet,
    optimizer: &mut dyn Optimizer,
    config: &Config,
    pb: &ProgressBar,
    rng: &mut R,
) -> f32 {
    let num_classes = model.num_classes();
    let mut total_loss = 0.0;
    let mut total = 0;

    for indices in shuffled_batches(set.len(), config.batch_size, rng) {
        let (mut images, labels) = set.gather(&indices);
        let mut targets = one_hot(&labels, num_classes);
        let mut rotation_targets = config
            .rotations
            .then(|| one_hot(&rotate_batch(&mut images), 4));
        if config.mixup {
            match rotation_targets.as_mut() {
                Some(rot) => mixup(&mut images, &mut [&mut targets, rot], rng),
                None => mixup(&mut images, &mut [&mut targets], rng),
            }
        }

        // ----------
        model.zero_grad();
        let output = model.forward(images.into_dyn());
        let mut loss = cross_entropy(&targets, &output.probs);
        if let (Some(rot), Some(rot_probs)) = (&rotation_targets, &output.rotation_probs) {
            loss = 0.5 * loss + 0.5 * cross_entropy(rot, rot_probs);
        }
        model.backward(&targets, rotation_targets.as_ref());
        optimizer.step(model.parameters());
        // ----------

        total_loss += loss * indices.len() as f32;
        total += indices.len();
        pb.inc(1);
    }
    total_loss / total.max(1) as f32
}

/// Cross-entropy, top-1 and top-5 accuracy of `model` on `set`.
pub fn test(model: &mut Classifier, set: &ImageSet, batch_size: usize) -> TestStats {
    let num_classes = model.num_classes();
    let (mut loss, mut top1, mut top5) = (0.0, 0, 0);

    for start in (0..set.len()).step_by(batch_size.max(1)) {
        let end = (start + batch_size).min(set.len());
        let (images, labels) = set.batch(start, end);
        let probs = model.forward(images.into_dyn()).probs;
        loss += cross_entropy(&one_hot(&labels, num_classes), &probs) as f64 * labels.len() as f64;

        for (row, &label) in probs.outer_iter().zip(&labels) {
            let target = row[label];
            let above = row.iter().filter(|&&p| p > target).count();
            if above == 0 {
                top1 += 1;
            }
            if above < 5 {
                top5 += 1;
            }
        }
    }

    let n = set.len().max(1) as f64;
    TestStats {
        loss: loss / n,
        top1: top1 as f64 / n,
        top5: top5 as f64 / n,
    }
}

/// Per-epoch few-shot scoring of the val and novel splits.
struct FewShotEval<'a> {
    data: &'a DatasetBundle,
    info: &'a FewShotInfo,
    episodes: &'a SplitEpisodes,
    protocol: Protocol,
    config: &'a Config,
}

impl FewShotEval<'_> {
    fn settings(&self) -> Vec<Setting> {
        let mut settings = Vec::new();
        for &shots in &self.config.n_shots {
            settings.push(Setting::new(shots, Rank::Top1));
            if self.config.n_ways > 5 {
                settings.push(Setting::new(shots, Rank::Top5));
            }
        }
        settings
    }

    /// (setting, val accuracy, novel accuracy) for the current model.
    fn evaluate(&self, model: &mut Classifier) -> Result<Vec<(Setting, f64, f64)>> {
        let bs = self.config.batch_size;
        let val_set = self
            .data
            .val
            .as_ref()
            .ok_or_else(|| Error::Dataset("few-shot dataset without a val split".to_string()))?;
        let val = FeatureBank::extract(model, val_set, self.info.val_classes, bs)?;
        let novel = FeatureBank::extract(model, &self.data.test, self.info.novel_classes, bs)?;
        let base_mean = if self.config.center_on_base {
            let base = FeatureBank::extract(model, &self.data.train, self.info.base_classes, bs)?;
            Some(base.prototype_mean())
        } else {
            None
        };
        let base_mean = base_mean.as_ref().map(|m| m.view());

        let mut results = Vec::new();
        for &shots in &self.config.n_shots {
            let val_acc = self.protocol.evaluate(&val, &self.episodes.val, shots, base_mean)?;
            let novel_acc = self.protocol.evaluate(&novel, &self.episodes.novel, shots, base_mean)?;
            for setting in self.settings().into_iter().filter(|s| s.shots == shots) {
                let pick = |a: &Accuracy| match setting.rank {
                    Rank::Top1 => a.top1,
                    Rank::Top5 => a.top5,
                };
                results.push((setting, pick(&val_acc), pick(&novel_acc)));
            }
        }
        Ok(results)
    }
}

fn create_optimizer(lr: f32) -> Box<dyn Optimizer> {
    if lr < 0.0 {
        Box::new(Adam::new(-lr))
    } else {
        Box::new(SGDMomentum::new(lr, MOMENTUM, WEIGHT_DECAY, true))
    }
}

/// Train `model` for `config.epochs` epochs and return the run's statistics.
///
/// Few-shot datasets report the novel accuracy of the best validation epoch
/// for every tracked setting; standard datasets report the last test
/// evaluation (`test_loss`, `test_acc` and, when enabled, `test_acc_top_5`).
pub fn train_complete<R: Rng + ?Sized>(
    model: &mut Classifier,
    data: &DatasetBundle,
    episodes: Option<&SplitEpisodes>,
    config: &Config,
    rng: &mut R,
) -> Result<BTreeMap<String, f64>> {
    let few_shot = match (data.few_shot(), episodes) {
        (Some(info), Some(episodes)) => Some(FewShotEval {
            data,
            info,
            episodes,
            protocol: Protocol {
                pipeline: config.pipeline.clone(),
                distance: config.distance,
            },
            config,
        }),
        (Some(_), None) => {
            return Err(Error::Config("few-shot training needs episodes".to_string()))
        }
        _ => None,
    };

    let mut optimizer = create_optimizer(config.lr);
    let schedule = MultiStepLr {
        base_lr: config.lr.abs(),
        milestones: config.milestones.clone(),
        gamma: config.gamma,
    };
    let mut tracker = MetaTracker::new();
    let mut last_test: Option<TestStats> = None;

    let batches_per_epoch = data.train.len().div_ceil(config.batch_size.max(1));
    let pb = if config.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new((config.epochs * batches_per_epoch) as u64)
    };
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    for epoch in 0..config.epochs {
        optimizer.set_learning_rate(schedule.lr_at(epoch));
        let train_loss = train_epoch(model, &data.train, optimizer.as_mut(), config, &pb, rng);
        debug!(epoch = epoch + 1, lr = optimizer.learning_rate(), train_loss, "epoch done");

        if let (Some(path), None) = (&config.save_model, &few_shot) {
            model.to_checkpoint(path)?;
        }
        if epoch < config.skip_epochs {
            continue;
        }

        match &few_shot {
            Some(eval) => {
                let results = eval.evaluate(model)?;
                for &(setting, val, novel) in &results {
                    tracker.update(setting, epoch + 1, val, novel);
                }
                pb.suspend(|| info!("epoch {}: {}", epoch + 1, few_shot_line(&results, &tracker)));
            }
            None => {
                let stats = test(model, &data.test, config.batch_size);
                if data.top5 {
                    pb.suspend(|| {
                        info!("top-1: {:.2}%, top-5: {:.2}%", 100.0 * stats.top1, 100.0 * stats.top5)
                    });
                } else {
                    pb.suspend(|| info!("test acc: {:.2}%", 100.0 * stats.top1));
                }
                last_test = Some(stats);
            }
        }
    }
    pb.finish_and_clear();

    // nothing was evaluated during training: score the final model once
    let mut stats = BTreeMap::new();
    match &few_shot {
        Some(eval) => {
            if tracker.summary().is_empty() {
                for (setting, val, novel) in eval.evaluate(model)? {
                    tracker.update(setting, config.epochs, val, novel);
                }
            }
            stats.extend(tracker.summary());
            if let Some(path) = &config.save_model {
                model.to_checkpoint(path)?;
            }
        }
        None => {
            let last = match last_test {
                Some(last) => last,
                None => test(model, &data.test, config.batch_size),
            };
            stats.insert("test_loss".to_string(), last.loss);
            stats.insert("test_acc".to_string(), last.top1);
            if data.top5 {
                stats.insert("test_acc_top_5".to_string(), last.top5);
            }
        }
    }
    Ok(stats)
}

/// `val-1: 61.20%, nov-1: 58.10% (58.10%), ...`, best novel in parentheses.
fn few_shot_line(results: &[(Setting, f64, f64)], tracker: &MetaTracker) -> String {
    results
        .iter()
        .map(|&(setting, val, novel)| {
            let best = tracker.best(setting).map_or(novel, |b| b.novel);
            let suffix = match setting.rank {
                Rank::Top1 => String::new(),
                Rank::Top5 => " top-5".to_string(),
            };
            format!(
                "val-{k}{suffix}: {:.2}%, nov-{k}{suffix}: {:.2}% ({:.2}%)",
                100.0 * val,
                100.0 * novel,
                100.0 * best,
                k = setting.shots,
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}
