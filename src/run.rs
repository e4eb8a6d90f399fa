use crate::config::Config;
use crate::dataset::{load_dataset, DatasetBundle};
use crate::error::{Error, Result};
use crate::features::FeatureBank;
use crate::fewshot::{Protocol, Rank, Setting, SplitEpisodes};
use crate::model::{create_model, Classifier};
use crate::stats::stats;
use crate::train::train_complete;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use tracing::{debug, info, warn};

/// Metric name --> one value per completed run.
pub type RunStats = BTreeMap<String, Vec<f64>>;

/// Run every configured training from scratch and return the per-run statistics.
///
/// With `--test-features`, only scores the given feature dump on the novel
/// episodes and returns empty statistics.
pub fn run(config: &Config) -> Result<RunStats> {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let data = load_dataset(&config.dataset, &config.dataset_options, &mut rng)?;
    let (_, height, width) = data.input_shape;
    if config.rotations && height != width {
        return Err(Error::Config(format!(
            "--rotations needs square images, got {height}x{width}"
        )));
    }

    // drawn once, shared by every run and epoch
    let episodes = data
        .few_shot()
        .map(|info| SplitEpisodes::define(info, &config.episode_config(), &mut rng))
        .transpose()?;

    if let Some(path) = &config.test_features {
        let episodes = episodes
            .as_ref()
            .ok_or_else(|| Error::Config("--test-features needs a few-shot dataset".to_string()))?;
        test_features(path, episodes, config)?;
        return Ok(RunStats::new());
    }

    let mut output = config.output.as_deref().map(open_output).transpose()?;
    if let Some(file) = output.as_mut() {
        write!(file, "{config:?}")?;
    }

    let mut run_stats = RunStats::new();
    let mut last_model = None;
    for i in 0..config.runs {
        debug!("{config:?}");
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(i as u64));
        let mut model = initial_model(config, &data, &mut rng)?;
        if i == 0 {
            info!(
                "Number of trainable parameters in model is: {}",
                model.num_parameters()
            );
        }

        let results = train_complete(&mut model, &data, episodes.as_ref(), config, &mut rng)?;
        for (key, value) in results {
            run_stats.entry(key).or_default().push(value);
        }

        if let Some(file) = output.as_mut() {
            write!(file, ", {}", serde_json::to_string(&run_stats)?)?;
            file.flush()?;
        }

        println!("Run {} / {}", i + 1, config.runs);
        for (label, key) in reported_metrics(&data, config) {
            if let Some(values) = run_stats.get(&key) {
                let interval = stats(values)?;
                println!(
                    "{label}: {:.2} (conf: [{:.2}, {:.2}])",
                    100.0 * interval.mean,
                    100.0 * interval.low,
                    100.0 * interval.high
                );
            }
        }
        last_model = Some(model);
    }

    if let (Some(path), Some(model)) = (&config.save_features, last_model.as_mut()) {
        save_features(model, &data, config.batch_size, path)?;
    }
    if let Some(file) = output.as_mut() {
        writeln!(file)?;
    }
    Ok(run_stats)
}

fn open_output(path: &str) -> Result<std::fs::File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Fresh model seeded by the run, or the `--load-model` checkpoint.
fn initial_model(config: &Config, data: &DatasetBundle, rng: &mut ChaCha8Rng) -> Result<Classifier> {
    let model = match &config.load_model {
        Some(path) => {
            let model = Classifier::from_checkpoint(path)?;
            info!("Loaded checkpoint from: {}", path);
            if config.rotations && model.rotation_head.is_none() {
                warn!("loaded model has no rotation head, rotations only augment the inputs");
            }
            model
        }
        None => create_model(
            config.architecture,
            config.feature_maps,
            data.input_shape,
            data.num_classes(),
            config.rotations,
            rng,
        )?,
    };
    if model.input_shape() != data.input_shape {
        return Err(Error::Model(format!(
            "model expects {:?} inputs, dataset '{}' has {:?}",
            model.input_shape(),
            config.dataset,
            data.input_shape
        )));
    }
    if model.num_classes() != data.num_classes() {
        return Err(Error::Model(format!(
            "model predicts {} classes, dataset '{}' trains {}",
            model.num_classes(),
            config.dataset,
            data.num_classes()
        )));
    }
    Ok(model)
}

/// (printed label, run statistic key) of the metrics summarized after each run.
fn reported_metrics(data: &DatasetBundle, config: &Config) -> Vec<(String, String)> {
    if data.few_shot().is_some() {
        let mut metrics = Vec::new();
        for &shots in &config.n_shots {
            let top1 = Setting::new(shots, Rank::Top1);
            metrics.push((format!("{shots}-shot"), format!("best_novel_{top1}")));
            if config.n_ways > 5 {
                let top5 = Setting::new(shots, Rank::Top5);
                metrics.push((format!("{shots}-shot top-5"), format!("best_novel_{top5}")));
            }
        }
        metrics
    } else {
        let mut metrics = vec![("Top-1".to_string(), "test_acc".to_string())];
        if data.top5 {
            metrics.push(("Top-5".to_string(), "test_acc_top_5".to_string()));
        }
        metrics
    }
}

fn test_features(path: &str, episodes: &SplitEpisodes, config: &Config) -> Result<()> {
    let bank = FeatureBank::load(path)?;
    if config.center_on_base {
        warn!("--center-on-base has no base features with --test-features, centering on the support mean");
    }
    info!(
        "Testing features of {} classes, dimension {}",
        bank.classes.len(),
        bank.dim()
    );
    let protocol = Protocol {
        pipeline: config.pipeline.clone(),
        distance: config.distance,
    };
    let results = config
        .n_shots
        .iter()
        .map(|&shots| {
            let acc = protocol.evaluate(&bank, &episodes.novel, shots, None)?;
            Ok(format!("{shots}-shot: {:.2}%", 100.0 * acc.top1))
        })
        .collect::<Result<Vec<_>>>()?;
    println!("{}", results.join(", "));
    Ok(())
}

/// Dump the test (novel) split features of `model`.
fn save_features(
    model: &mut Classifier,
    data: &DatasetBundle,
    batch_size: usize,
    path: &str,
) -> Result<()> {
    let num_classes = match data.few_shot() {
        Some(info) => info.novel_classes,
        None => data.num_classes(),
    };
    let bank = FeatureBank::extract(model, &data.test, num_classes, batch_size)?;
    bank.save(path)?;
    info!("Saved {} x {} features to {}", data.test.len(), bank.dim(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use crate::model::Architecture;
    use clap::Parser;

    fn config(extra: &[&str]) -> Config {
        let mut argv = vec!["fsnet", "--quiet", "--dataset", "synthetic"];
        argv.extend_from_slice(extra);
        Config::from_args(Args::try_parse_from(argv).unwrap()).unwrap()
    }

    #[test]
    fn metrics_follow_the_shot_settings() {
        let config = config(&["--n-shots", "[1,5]"]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let data = load_dataset("synthetic", &config.dataset_options, &mut rng).unwrap();
        let metrics = reported_metrics(&data, &config);
        assert_eq!(
            metrics,
            vec![
                ("1-shot".to_string(), "best_novel_1shot_top1".to_string()),
                ("5-shot".to_string(), "best_novel_5shot_top1".to_string()),
            ]
        );
    }

    #[test]
    fn runs_accumulate_and_features_reload() {
        let dir = std::env::temp_dir().join(format!("fsnet_run_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let features = dir.join("features.json");
        let output = dir.join("log.txt");
        let config = config(&[
            "--epochs",
            "1",
            "--runs",
            "2",
            "--n-runs",
            "20",
            "--feature-maps",
            "8",
            "--save-features",
            features.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
        ]);
        let stats = run(&config).unwrap();
        assert_eq!(stats["best_novel_1shot_top1"].len(), 2);
        assert_eq!(stats["best_novel_5shot_top1"].len(), 2);

        let log = std::fs::read_to_string(&output).unwrap();
        assert!(log.starts_with("Config {"));
        assert_eq!(log.matches(", {").count(), 2);
        assert!(log.ends_with('\n'));

        let replay = Config {
            test_features: Some(features.to_str().unwrap().to_string()),
            ..config
        };
        assert!(run(&replay).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn checkpoint_for_other_inputs_is_refused() {
        let path = std::env::temp_dir().join(format!("fsnet_small_model_{}.json", std::process::id()));
        let path = path.to_str().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        // synthetic trains 16 classes on 1x8x8 images
        let model = create_model(Architecture::Mlp(1), 8, (1, 4, 4), 16, false, &mut rng).unwrap();
        model.to_checkpoint(path).unwrap();

        let config = config(&["--epochs", "1", "--n-runs", "5", "--load-model", path]);
        let res = run(&config);
        std::fs::remove_file(path).ok();
        assert!(matches!(res, Err(Error::Model(_))));
    }

    #[test]
    fn unknown_dataset_fails_before_training() {
        let mut config = config(&[]);
        config.dataset = "nope".to_string();
        assert!(matches!(run(&config), Err(Error::Config(_))));
    }
}
