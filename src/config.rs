//! Command line options and their validated form.

use crate::dataset::DatasetOptions;
use crate::error::{Error, Result};
use crate::fewshot::{Distance, EpisodeConfig, Pipeline};
use crate::model::Architecture;
use clap::Parser;
use std::path::PathBuf;

/// Train image classifiers and evaluate them, in few-shot settings with
/// nearest-class-mean episodes.
///
/// Examples:
///   fsnet --dataset mnist --model mlp2 --epochs 30 --milestones "[10,20]"
///   fsnet --dataset synthetic --model mlp2 --feature-maps 32 --epochs 20 --milestones "[10,15]"
///   fsnet --dataset folderfs --model convnet --mixup --rotations --preprocessing EME
#[derive(Parser, Debug, Clone)]
#[command(version, about, verbatim_doc_comment)]
pub struct Args {
    /// Batch size
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    /// Width of the feature extractor (hidden units or conv channels)
    #[arg(long, default_value_t = 64)]
    pub feature_maps: usize,
    /// Initial learning rate (negative is for Adam, e.g. -0.001)
    #[arg(long, default_value_t = 0.1, allow_hyphen_values = true)]
    pub lr: f32,
    /// Total number of epochs
    #[arg(long, default_value_t = 350)]
    pub epochs: usize,
    /// Epochs at which the learning rate is multiplied by gamma
    #[arg(long, default_value = "[100,200,300]")]
    pub milestones: String,
    /// Multiplier for the learning rate at milestones
    #[arg(long, default_value_t = 0.1)]
    pub gamma: f32,
    /// Use mixup from the first epoch
    #[arg(long)]
    pub mixup: bool,
    /// Use rotation self-supervision during training
    #[arg(long)]
    pub rotations: bool,
    /// Model to train: mlp<N> or convnet
    #[arg(long, default_value = "mlp2")]
    pub model: String,
    /// Few-shot preprocessing sequence over P (sqrt), E (sphering), M (centering)
    #[arg(long, default_value = "PEME")]
    pub preprocessing: String,
    /// Few-shot distance: euclidean or cosine
    #[arg(long, default_value = "euclidean")]
    pub distance: String,
    /// Center few-shot features on the mean of base-class prototypes
    /// (not available with --test-features, which centers on the support)
    #[arg(long)]
    pub center_on_base: bool,

    /// Dataset root directory
    #[arg(long, env = "DATASETS")]
    pub dataset_path: Option<PathBuf>,
    /// Dataset to use: mnist, folder, folderfs or synthetic
    #[arg(long, default_value = "synthetic")]
    pub dataset: String,
    /// Number of training samples to keep (standard classification only)
    #[arg(long)]
    pub dataset_size: Option<usize>,
    /// Side of the square images of folder datasets
    #[arg(long, default_value_t = 32)]
    pub image_size: usize,
    /// Load folder datasets in greyscale
    #[arg(long)]
    pub grayscale: bool,

    /// Number of epochs to skip before evaluating
    #[arg(long, default_value_t = 0)]
    pub skip_epochs: usize,
    /// Number of runs (complete trainings from scratch)
    #[arg(long, default_value_t = 1)]
    pub runs: usize,
    /// Only print warnings and final results
    #[arg(long)]
    pub quiet: bool,
    /// Print debug information
    #[arg(long, conflicts_with = "quiet")]
    pub verbose: bool,
    /// Seed for episodes, initialization and shuffling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Ways per few-shot episode
    #[arg(long, default_value_t = 5)]
    pub n_ways: usize,
    /// Shot settings evaluated on every episode
    #[arg(long, default_value = "[1,5]")]
    pub n_shots: String,
    /// Queries per way
    #[arg(long, default_value_t = 15)]
    pub n_queries: usize,
    /// Episodes per evaluation split
    #[arg(long, default_value_t = 10_000)]
    pub n_runs: usize,

    /// Append configuration and run statistics to this file
    #[arg(long)]
    pub output: Option<String>,
    /// Save the novel features of the last model to this file
    #[arg(long)]
    pub save_features: Option<String>,
    /// Save the model to this file
    #[arg(long)]
    pub save_model: Option<String>,
    /// Evaluate a feature dump on the novel episodes and exit
    #[arg(long)]
    pub test_features: Option<String>,
    /// Start from this model checkpoint instead of a fresh model
    #[arg(long)]
    pub load_model: Option<String>,
}

/// Validated configuration of one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub batch_size: usize,
    pub feature_maps: usize,
    pub lr: f32,
    pub epochs: usize,
    pub milestones: Vec<usize>,
    pub gamma: f32,
    pub mixup: bool,
    pub rotations: bool,
    pub architecture: Architecture,
    pub pipeline: Pipeline,
    pub distance: Distance,
    pub center_on_base: bool,
    pub dataset: String,
    pub dataset_options: DatasetOptions,
    pub skip_epochs: usize,
    pub runs: usize,
    pub quiet: bool,
    pub verbose: bool,
    pub seed: u64,
    pub n_ways: usize,
    pub n_shots: Vec<usize>,
    pub n_queries: usize,
    pub n_runs: usize,
    pub output: Option<String>,
    pub save_features: Option<String>,
    pub save_model: Option<String>,
    pub test_features: Option<String>,
    pub load_model: Option<String>,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Config> {
        if args.batch_size == 0 || args.feature_maps == 0 || args.runs == 0 {
            return Err(Error::Config(
                "batch-size, feature-maps and runs must be positive".to_string(),
            ));
        }
        if args.lr == 0.0 {
            return Err(Error::Config("learning rate cannot be 0".to_string()));
        }
        let n_shots = parse_list(&args.n_shots, "n-shots")?;
        if n_shots.is_empty() || n_shots.contains(&0) {
            return Err(Error::Config(format!(
                "n-shots needs positive shot counts, got {}",
                args.n_shots
            )));
        }

        Ok(Config {
            batch_size: args.batch_size,
            feature_maps: args.feature_maps,
            lr: args.lr,
            epochs: args.epochs,
            milestones: parse_list(&args.milestones, "milestones")?,
            gamma: args.gamma,
            mixup: args.mixup,
            rotations: args.rotations,
            architecture: Architecture::parse(&args.model)?,
            pipeline: args.preprocessing.parse()?,
            distance: args.distance.parse()?,
            center_on_base: args.center_on_base,
            dataset: args.dataset,
            dataset_options: DatasetOptions {
                path: args.dataset_path,
                image_size: args.image_size,
                grayscale: args.grayscale,
                dataset_size: args.dataset_size,
                seed: args.seed,
            },
            skip_epochs: args.skip_epochs,
            runs: args.runs,
            quiet: args.quiet,
            verbose: args.verbose,
            seed: args.seed,
            n_ways: args.n_ways,
            n_shots,
            n_queries: args.n_queries,
            n_runs: args.n_runs,
            output: args.output,
            save_features: args.save_features,
            save_model: args.save_model,
            test_features: args.test_features,
            load_model: args.load_model,
        })
    }

    pub fn episode_config(&self) -> EpisodeConfig {
        EpisodeConfig {
            n_ways: self.n_ways,
            max_shots: self.n_shots.iter().copied().max().unwrap_or(1),
            n_queries: self.n_queries,
            n_runs: self.n_runs,
        }
    }
}

/// Parse a list such as `"[100, 200,300]"` (brackets optional, `"[]"` is empty).
pub fn parse_list(s: &str, what: &str) -> Result<Vec<usize>> {
    let inner = s.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<usize>()
                .map_err(|_| Error::Config(format!("bad {what} entry '{item}' in \"{s}\"")))
        })
        .collect()
}
