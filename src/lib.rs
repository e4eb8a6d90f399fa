pub mod augment;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod fewshot;
pub mod layers;
pub mod logging;
pub mod model;
pub mod optim;
pub mod run;
pub mod stats;
pub mod train;

pub use error::{Error, Result};
