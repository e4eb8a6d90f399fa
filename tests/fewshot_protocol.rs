use clap::Parser;
use fsnet::config::{Args, Config};
use fsnet::dataset::load_dataset;
use fsnet::features::FeatureBank;
use fsnet::fewshot::{define_runs, Distance, EpisodeConfig, Pipeline, Protocol, SplitEpisodes};
use fsnet::model::create_model;
use fsnet::train::train_complete;
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Class `c` is a small cloud around (10c, 10c).
fn diagonal_clouds(n_classes: usize, per_class: usize, rng: &mut ChaCha8Rng) -> FeatureBank {
    let noise = Normal::new(0.0, 0.5).unwrap();
    let classes = (0..n_classes)
        .map(|c| Array2::<f32>::random_using((per_class, 2), noise, rng) + 10.0 * c as f32)
        .collect();
    FeatureBank { classes }
}

#[test]
fn well_separated_features_give_perfect_one_shot_accuracy() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let bank = diagonal_clouds(8, 30, &mut rng);
    let config = EpisodeConfig {
        n_ways: 5,
        max_shots: 1,
        n_queries: 15,
        n_runs: 200,
    };
    let episodes = define_runs(&config, &bank.elements_per_class(), &mut rng).unwrap();
    let protocol = Protocol {
        pipeline: Pipeline::default(),
        distance: Distance::Euclidean,
    };
    let acc = protocol.evaluate(&bank, &episodes, 1, None).unwrap();
    assert_eq!(acc.top1, 1.0);
    assert_eq!(acc.top5, 1.0);
}

#[test]
fn peme_is_deterministic() {
    let mut rng = ChaCha8Rng::seed_from_u64(6);
    let support = Array3::<f32>::random_using((5, 5, 16), Normal::new(0.3, 1.0).unwrap(), &mut rng);
    let queries = Array3::<f32>::random_using((5, 15, 16), Normal::new(0.3, 1.0).unwrap(), &mut rng);
    let pipeline: Pipeline = "PEME".parse().unwrap();

    let run = || {
        let (mut s, mut q) = (support.clone(), queries.clone());
        pipeline.apply(&mut s, &mut q, None);
        (s, q)
    };
    assert_eq!(run(), run());
}

#[test]
fn short_training_on_synthetic_scores_novel_classes() {
    let argv = [
        "fsnet",
        "--quiet",
        "--dataset",
        "synthetic",
        "--model",
        "mlp1",
        "--feature-maps",
        "32",
        "--epochs",
        "3",
        "--milestones",
        "[2]",
        "--lr",
        "0.05",
        "--n-runs",
        "100",
    ];
    let config = Config::from_args(Args::try_parse_from(argv).unwrap()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let data = load_dataset(&config.dataset, &config.dataset_options, &mut rng).unwrap();
    let info = data.few_shot().unwrap();
    let episodes = SplitEpisodes::define(info, &config.episode_config(), &mut rng).unwrap();

    let mut model = create_model(
        config.architecture,
        config.feature_maps,
        data.input_shape,
        data.num_classes(),
        config.rotations,
        &mut rng,
    )
    .unwrap();
    let stats = train_complete(&mut model, &data, Some(&episodes), &config, &mut rng).unwrap();

    assert_eq!(stats.len(), 2);
    let one = stats["best_novel_1shot_top1"];
    let five = stats["best_novel_5shot_top1"];
    assert!((0.0..=1.0).contains(&one));
    // chance is 20%
    assert!(five > 0.4, "5-shot accuracy {five}");
}
