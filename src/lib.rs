//! Runs waves of single-point quantum chemistry jobs on one node: each unit's
//! input is staged into scratch, run on its own slice of cores, classified
//! from its log, and archived or recorded as a failure.

pub mod affinity;
pub mod archive;
pub mod calc;
pub mod classify;
pub mod config;
pub mod energy;
pub mod error;
pub mod marker;
pub mod runner;
pub mod stage;
pub mod unit;
pub mod utils;
pub mod wave;

pub use config::Config;
pub use error::{Error, Result};
pub use wave::{CancelHandle, Progress, Wave, WaveResult, WaveScheduler};

#[cfg(test)]
mod tests;
