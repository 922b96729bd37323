//! Stochastic reaction-network abstraction.
//!
//! Exact Gillespie simulation of a reaction network generates randomized
//! trajectory datasets, and a mixture-density recurrent network trained on
//! those trajectories produces fast approximate rollouts without re-running
//! the exact solver.
//!
//! Pipeline: [`network`] definition → [`model::GillespieModel`] →
//! [`randomize`] → [`dataset::DatasetGenerator`] → [`train::Trainer`] →
//! [`sampler::AutoregressiveSampler`].

pub mod artifact;
pub mod config;
pub mod dataset;
pub mod model;
pub mod monitor;
pub mod network;
pub mod output;
pub mod randomize;
pub mod sampler;
pub mod ssa;
pub mod surrogate;
pub mod train;

use thiserror::Error;

pub use artifact::{ModelArtifact, ModelSpecMetadata};
pub use config::{
    Device, PipelineConfig, RandomizationConfig, SamplerConfig, SimulationConfig,
    SurrogateConfig, TrainingConfig,
};
pub use dataset::{DatasetBundle, DatasetGenerator, GenerationOutcome, GenerationStatus, TrajectoryTensor};
pub use model::{GillespieModel, ReactionSolver};
pub use monitor::{Hooks, RunMonitor, Unmonitored};
pub use network::NetworkDefinition;
pub use randomize::{InitialConditionSet, ParameterPerturbationSet, Randomizer};
pub use sampler::{AutoregressiveSampler, RoundingPolicy};
pub use surrogate::{Architecture, MdnNetwork, SurrogateWeights};
pub use train::{StopReason, Trainer, TrainingReport, TrainingState, ValidationReport};

#[derive(Debug, Error)]
pub enum CrnError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("shape mismatch for {tensor}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        tensor: String,
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("empty dataset: {0}")]
    EmptyDataset(String),
    #[error("unknown {kind} '{name}'")]
    UnknownName { kind: &'static str, name: String },
    #[error("{context} length mismatch: expected {expected}, got {got}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
}

pub type Result<T> = std::result::Result<T, CrnError>;

impl CrnError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        CrnError::Parse {
            line,
            message: message.into(),
        }
    }
}

pub(crate) fn ensure_len(context: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        return Ok(());
    }

    Err(CrnError::LengthMismatch {
        context,
        expected,
        got,
    })
}
