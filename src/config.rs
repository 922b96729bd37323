use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sampler::RoundingPolicy;
use crate::{CrnError, Result};

/// Simulation window and dataset dimensions for stochastic trajectory generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Time of the first recorded point
    pub start_time: f64,
    /// Time of the last recorded point
    pub end_time: f64,
    /// Number of intervals; every trajectory has `n_steps + 1` points
    pub n_steps: usize,
    /// Randomized initial conditions per dataset
    pub n_init_conditions: usize,
    /// Stochastic replicates per initial condition
    pub n_sims_per_init_condition: usize,
    /// Solver seed, 0 means entropy-seeded
    pub random_seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            end_time: 50.0,
            n_steps: 50,
            n_init_conditions: 100,
            n_sims_per_init_condition: 10,
            random_seed: 0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.start_time.is_finite() || !self.end_time.is_finite() {
            return Err(CrnError::InvalidConfig(
                "start_time and end_time must be finite".to_string(),
            ));
        }

        if self.end_time <= self.start_time {
            return Err(CrnError::InvalidConfig(
                "end_time must be greater than start_time".to_string(),
            ));
        }

        if self.n_steps == 0 {
            return Err(CrnError::InvalidConfig(
                "n_steps must be greater than zero".to_string(),
            ));
        }

        if self.n_init_conditions == 0 {
            return Err(CrnError::InvalidConfig(
                "n_init_conditions must be greater than zero".to_string(),
            ));
        }

        if self.n_sims_per_init_condition == 0 {
            return Err(CrnError::InvalidConfig(
                "n_sims_per_init_condition must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn step_size(&self) -> f64 {
        (self.end_time - self.start_time) / self.n_steps as f64
    }

    pub fn n_points(&self) -> usize {
        self.n_steps + 1
    }

    pub fn n_samples(&self) -> usize {
        self.n_init_conditions * self.n_sims_per_init_condition
    }
}

/// Perturbation policy for initial conditions and rate parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizationConfig {
    pub range_percentage: f64,
    pub zero_perturb_prob: f64,
    pub zero_perturb_range: (f64, f64),
    pub perturb_parameters: bool,
    pub parameter_range_percentage: f64,
    /// Seed for the randomization stream, 0 means entropy-seeded
    pub seed: u64,
}

impl Default for RandomizationConfig {
    fn default() -> Self {
        Self {
            range_percentage: 0.1,
            zero_perturb_prob: 0.9,
            zero_perturb_range: (0.0, 10.0),
            perturb_parameters: false,
            parameter_range_percentage: 0.1,
            seed: 0,
        }
    }
}

impl RandomizationConfig {
    pub fn validate(&self) -> Result<()> {
        check_fraction("range_percentage", self.range_percentage)?;
        check_fraction("zero_perturb_prob", self.zero_perturb_prob)?;
        check_fraction("parameter_range_percentage", self.parameter_range_percentage)?;

        let (low, high) = self.zero_perturb_range;
        if !low.is_finite() || !high.is_finite() || low > high {
            return Err(CrnError::InvalidConfig(
                "zero_perturb_range must be a finite (low, high) pair with low <= high".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub n_epochs: usize,
    pub patience: usize,
    pub batch_size: usize,
    /// Leading share of trajectories used for training; the rest is held out
    pub train_fraction: f64,
    pub learning_rate: f64,
    /// Stop as converged once the monitored loss reaches this value
    pub target_loss: Option<f64>,
    /// Load the best checkpoint back into the model when training ends
    pub restore_best: bool,
    /// Best weights are also written here on every improvement
    pub checkpoint_path: Option<PathBuf>,
    /// Shuffle seed, 0 means entropy-seeded
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_epochs: 20,
            patience: 8,
            batch_size: 128,
            train_fraction: 0.8,
            learning_rate: 1.0e-3,
            target_loss: None,
            restore_best: true,
            checkpoint_path: None,
            seed: 0,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_epochs == 0 {
            return Err(CrnError::InvalidConfig("n_epochs must be >= 1".to_string()));
        }
        if self.patience == 0 {
            return Err(CrnError::InvalidConfig("patience must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(CrnError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction <= 1.0) {
            return Err(CrnError::InvalidConfig(
                "train_fraction must be in (0, 1]".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(CrnError::InvalidConfig(
                "learning_rate must be a positive finite value".to_string(),
            ));
        }
        if let Some(target) = self.target_loss {
            if !target.is_finite() {
                return Err(CrnError::InvalidConfig(
                    "target_loss must be finite".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Compute device for surrogate evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub device: Device,
    /// Weight initialization seed, 0 means entropy-seeded
    pub init_seed: u64,
}

impl Default for SurrogateConfig {
    fn default() -> Self {
        Self {
            hidden_size: 50,
            num_layers: 2,
            device: Device::Cpu,
            init_seed: 0,
        }
    }
}

impl SurrogateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(CrnError::InvalidConfig("hidden_size must be >= 1".to_string()));
        }
        if self.num_layers == 0 {
            return Err(CrnError::InvalidConfig("num_layers must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub n_steps: usize,
    pub n_sims_per_condition: usize,
    pub rounding: RoundingPolicy,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_steps: 10,
            n_sims_per_condition: 1,
            rounding: RoundingPolicy::Nearest,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_steps == 0 {
            return Err(CrnError::InvalidConfig(
                "sampler n_steps must be >= 1".to_string(),
            ));
        }
        if self.n_sims_per_condition == 0 {
            return Err(CrnError::InvalidConfig(
                "sampler n_sims_per_condition must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Every stage of the pipeline in one TOML document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub simulation: SimulationConfig,
    pub randomization: RandomizationConfig,
    pub training: TrainingConfig,
    pub surrogate: SurrogateConfig,
    pub sampler: SamplerConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        self.randomization.validate()?;
        self.training.validate()?;
        self.surrogate.validate()?;
        self.sampler.validate()?;
        Ok(())
    }
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        return Ok(());
    }

    Err(CrnError::InvalidConfig(format!("{name} must be in [0, 1]")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn step_size_spans_window() {
        let cfg = SimulationConfig {
            start_time: 0.0,
            end_time: 10.0,
            n_steps: 20,
            ..SimulationConfig::default()
        };
        assert!((cfg.step_size() - 0.5).abs() < 1e-12);
        assert_eq!(cfg.n_points(), 21);
    }

    #[test]
    fn rejects_inverted_window() {
        let cfg = SimulationConfig {
            start_time: 5.0,
            end_time: 1.0,
            ..SimulationConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CrnError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_patience() {
        let cfg = TrainingConfig {
            patience: 0,
            ..TrainingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let cfg = RandomizationConfig {
            zero_perturb_prob: 1.5,
            ..RandomizationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let raw = r#"
            [simulation]
            end_time = 20.0
            n_steps = 40

            [training]
            n_epochs = 5
            patience = 2
        "#;
        let cfg = PipelineConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.simulation.n_steps, 40);
        assert_eq!(cfg.simulation.n_init_conditions, 100);
        assert_eq!(cfg.training.n_epochs, 5);
        assert_eq!(cfg.training.batch_size, 128);
        assert_eq!(cfg.surrogate.device, Device::Cpu);
    }

    #[test]
    fn shipped_default_config_matches_defaults() {
        let cfg = PipelineConfig::from_toml_str(include_str!("../configs/default.toml")).unwrap();
        assert_eq!(cfg, PipelineConfig::default());
    }
}
