pub mod aggregator;
pub mod cache;
pub mod calibration;
pub mod config;
pub mod emitter;
pub mod error;
pub mod features;
pub mod game_log;
pub mod grading;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod source;
pub mod split;
pub mod store;
pub mod synthetic;
pub mod trainer;
pub mod weighting;

pub use error::{PipelineError, Result};
