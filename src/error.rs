//! Error type shared by the whole harness.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad command line value, caught before any training happens.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model error: {0}")]
    Model(String),

    /// A class cannot provide `needed` distinct elements for an episode.
    #[error(
        "Configuration error: class {class} has {available} elements, episodes need {needed} (shots + queries)"
    )]
    InsufficientElements {
        class: usize,
        available: usize,
        needed: usize,
    },

    #[error("Not enough samples to compute statistics: got {0}")]
    InsufficientSamples(usize),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, Error>;
