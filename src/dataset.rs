//! Trajectory datasets produced by the exact solver.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::artifact::ModelSpecMetadata;
use crate::config::SimulationConfig;
use crate::model::ReactionSolver;
use crate::monitor::RunMonitor;
use crate::randomize::{InitialConditionSet, ParameterPerturbationSet};
use crate::{ensure_len, CrnError, Result};

/// Dense `(sample, time step, variable)` array stored row-major.
///
/// Variable 0 is time, followed by the species in model order and then any
/// constant parameter columns. Every sample has the same number of points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryTensor {
    variable_names: Vec<String>,
    n_samples: usize,
    n_points: usize,
    data: Vec<f64>,
}

impl TrajectoryTensor {
    pub fn new(variable_names: Vec<String>, n_points: usize) -> Self {
        Self {
            variable_names,
            n_samples: 0,
            n_points,
            data: Vec::new(),
        }
    }

    pub fn from_parts(
        variable_names: Vec<String>,
        n_samples: usize,
        n_points: usize,
        data: Vec<f64>,
    ) -> Result<Self> {
        ensure_len(
            "tensor data",
            n_samples * n_points * variable_names.len(),
            data.len(),
        )?;
        Ok(Self {
            variable_names,
            n_samples,
            n_points,
            data,
        })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_samples, self.n_points, self.variable_names.len())
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    pub fn n_vars(&self) -> usize {
        self.variable_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_samples == 0
    }

    pub fn variable_names(&self) -> &[String] {
        &self.variable_names
    }

    pub fn get(&self, sample: usize, point: usize, var: usize) -> f64 {
        self.data[(sample * self.n_points + point) * self.n_vars() + var]
    }

    /// One time point of one sample, all variables.
    pub fn point(&self, sample: usize, point: usize) -> &[f64] {
        let width = self.n_vars();
        let start = (sample * self.n_points + point) * width;
        &self.data[start..start + width]
    }

    /// All points of one sample, flattened row-major.
    pub fn sample(&self, sample: usize) -> &[f64] {
        let len = self.n_points * self.n_vars();
        &self.data[sample * len..(sample + 1) * len]
    }

    /// Appends a flattened `(n_points, n_vars)` sample.
    pub fn push_flat(&mut self, rows: &[f64]) -> Result<()> {
        ensure_len("trajectory sample", self.n_points * self.n_vars(), rows.len())?;
        self.data.extend_from_slice(rows);
        self.n_samples += 1;
        Ok(())
    }

    /// Appends a solver trajectory, broadcasting `extra` across every row.
    pub fn push_trajectory(&mut self, trajectory: &DMatrix<f64>, extra: &[f64]) -> Result<()> {
        ensure_len("trajectory points", self.n_points, trajectory.nrows())?;
        ensure_len(
            "trajectory columns",
            self.n_vars(),
            trajectory.ncols() + extra.len(),
        )?;

        for row in trajectory.row_iter() {
            self.data.extend(row.iter().copied());
            self.data.extend_from_slice(extra);
        }
        self.n_samples += 1;
        Ok(())
    }

    /// Per-condition mean and population standard deviation across replicates.
    ///
    /// Samples are grouped in consecutive blocks of `n_sims`, matching the
    /// condition-major order the generator writes.
    pub fn condition_summary(&self, n_sims: usize) -> Result<ConditionSummary> {
        if n_sims == 0 || self.n_samples % n_sims != 0 {
            return Err(CrnError::Validation(format!(
                "{} samples cannot be grouped into blocks of {n_sims}",
                self.n_samples
            )));
        }

        let n_conditions = self.n_samples / n_sims;
        let width = self.n_vars();
        let block = self.n_points * width;
        let mut mean = vec![0.0; n_conditions * block];
        let mut std = vec![0.0; n_conditions * block];

        for cond in 0..n_conditions {
            let out = cond * block;
            for rep in 0..n_sims {
                for (acc, value) in mean[out..out + block]
                    .iter_mut()
                    .zip(self.sample(cond * n_sims + rep))
                {
                    *acc += value;
                }
            }
            for acc in &mut mean[out..out + block] {
                *acc /= n_sims as f64;
            }
            for rep in 0..n_sims {
                let sample = self.sample(cond * n_sims + rep);
                for i in 0..block {
                    let diff = sample[i] - mean[out + i];
                    std[out + i] += diff * diff;
                }
            }
            for acc in &mut std[out..out + block] {
                *acc = (*acc / n_sims as f64).sqrt();
            }
        }

        Ok(ConditionSummary {
            variable_names: self.variable_names.clone(),
            n_conditions,
            n_points: self.n_points,
            mean,
            std,
        })
    }

    /// First point of every `n_sims`-th sample, restricted to `species` columns.
    pub fn initial_conditions(&self, n_sims: usize, species: &[String]) -> Result<InitialConditionSet> {
        if n_sims == 0 {
            return Err(CrnError::Validation("n_sims must be >= 1".to_string()));
        }

        let columns = species
            .iter()
            .map(|name| {
                self.variable_names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| CrnError::UnknownName {
                        kind: "tensor column",
                        name: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let rows = (0..self.n_samples)
            .step_by(n_sims)
            .map(|s| {
                let first = self.point(s, 0);
                columns.iter().map(|&c| first[c]).collect()
            })
            .collect();
        InitialConditionSet::new(species.to_vec(), rows)
    }
}

/// Output of [`TrajectoryTensor::condition_summary`], laid out like the tensor
/// with conditions in place of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionSummary {
    pub variable_names: Vec<String>,
    pub n_conditions: usize,
    pub n_points: usize,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl ConditionSummary {
    pub fn index(&self, condition: usize, point: usize, var: usize) -> usize {
        (condition * self.n_points + point) * self.variable_names.len() + var
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GenerationStatus {
    Complete,
    /// Canceled before every condition ran.
    Partial { conditions_completed: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub tensor: TrajectoryTensor,
    pub status: GenerationStatus,
}

/// Runs the exact solver over every (condition, replicate) pair.
#[derive(Debug, Clone)]
pub struct DatasetGenerator {
    config: SimulationConfig,
}

impl DatasetGenerator {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Simulates `n_sims_per_init_condition` replicates of every condition.
    ///
    /// Before each replicate the model is reset and the condition's species
    /// values (and parameter values, when given) are assigned. Parameter
    /// values are appended as constant columns. Cancellation is checked
    /// before each condition; a canceled run returns the samples finished so
    /// far with [`GenerationStatus::Partial`].
    pub fn generate<S, M>(
        &self,
        model: &mut S,
        conditions: &InitialConditionSet,
        parameters: Option<&ParameterPerturbationSet>,
        monitor: &mut M,
    ) -> Result<GenerationOutcome>
    where
        S: ReactionSolver + ?Sized,
        M: RunMonitor + ?Sized,
    {
        if conditions.is_empty() {
            return Err(CrnError::EmptyDataset(
                "no initial conditions to simulate".to_string(),
            ));
        }
        if let Some(params) = parameters {
            ensure_len("parameter sets", conditions.len(), params.len())?;
        }

        let mut variable_names = vec!["time".to_string()];
        variable_names.extend(model.species_names().iter().cloned());
        if let Some(params) = parameters {
            variable_names.extend(params.names().iter().cloned());
        }

        let n_conditions = conditions.len();
        let n_sims = self.config.n_sims_per_init_condition;
        let mut tensor = TrajectoryTensor::new(variable_names, self.config.n_points());
        info!(
            "generating {} trajectories ({} conditions x {} replicates, {} points each)",
            n_conditions * n_sims,
            n_conditions,
            n_sims,
            self.config.n_points()
        );

        monitor.set_progress(0.0);
        for cond in 0..n_conditions {
            if monitor.is_canceled() {
                warn!("generation canceled after {cond} of {n_conditions} conditions");
                return Ok(GenerationOutcome {
                    tensor,
                    status: GenerationStatus::Partial {
                        conditions_completed: cond,
                    },
                });
            }

            let species = conditions.assignments(cond);
            let params = parameters.map(|p| p.assignments(cond));
            let extra: Vec<f64> = params
                .as_ref()
                .map(|p| p.iter().map(|(_, v)| *v).collect())
                .unwrap_or_default();

            for rep in 0..n_sims {
                model.reset();
                model.set_values(&species)?;
                if let Some(params) = &params {
                    model.set_values(params)?;
                }
                let trajectory =
                    model.simulate(self.config.start_time, self.config.end_time, self.config.n_steps)?;
                tensor.push_trajectory(&trajectory, &extra)?;
                debug!("condition {cond} replicate {rep} done");
            }

            monitor.set_progress((cond + 1) as f64 / n_conditions as f64);
        }

        info!("generated tensor with shape {:?}", tensor.shape());
        Ok(GenerationOutcome {
            tensor,
            status: GenerationStatus::Complete,
        })
    }
}

/// Runs `n` replicates of the model's current state, without randomization.
///
/// The state held when this is called is restored before each replicate.
pub fn simulate_replicates<S>(model: &mut S, config: &SimulationConfig, n: usize) -> Result<TrajectoryTensor>
where
    S: ReactionSolver + ?Sized,
{
    if n == 0 {
        return Err(CrnError::EmptyDataset("zero replicates requested".to_string()));
    }

    let state = model.get_values();
    let mut variable_names = vec!["time".to_string()];
    variable_names.extend(model.species_names().iter().cloned());
    let mut tensor = TrajectoryTensor::new(variable_names, config.n_points());

    for _ in 0..n {
        model.reset();
        model.set_values(&state)?;
        let trajectory = model.simulate(config.start_time, config.end_time, config.n_steps)?;
        tensor.push_trajectory(&trajectory, &[])?;
    }
    Ok(tensor)
}

/// A generated tensor together with the metadata needed to interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetBundle {
    pub metadata: ModelSpecMetadata,
    pub status: GenerationStatus,
    pub tensor: TrajectoryTensor,
}

impl DatasetBundle {
    pub fn new(metadata: ModelSpecMetadata, outcome: GenerationOutcome) -> Result<Self> {
        let mut expected = vec!["time".to_string()];
        expected.extend(metadata.species.iter().cloned());
        if metadata.includes_parameters {
            expected.extend(metadata.parameters.iter().cloned());
        }
        if expected != outcome.tensor.variable_names() {
            return Err(CrnError::Validation(format!(
                "tensor columns {:?} do not match metadata {:?}",
                outcome.tensor.variable_names(),
                expected
            )));
        }

        Ok(Self {
            metadata,
            status: outcome.status,
            tensor: outcome.tensor,
        })
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_string(self)?;
        fs::write(path, payload)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let bundle: DatasetBundle = serde_json::from_str(&raw)?;
        let (n_samples, n_points, n_vars) = bundle.tensor.shape();
        ensure_len(
            "tensor data",
            n_samples * n_points * n_vars,
            bundle.tensor.data.len(),
        )?;
        Ok(bundle)
    }

    /// Initial condition of every condition block, in species order.
    pub fn initial_conditions(&self) -> Result<InitialConditionSet> {
        self.tensor.initial_conditions(
            self.metadata.simulation.n_sims_per_init_condition,
            &self.metadata.species,
        )
    }
}
