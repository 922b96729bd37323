//! Autoregressive rollout of a trained surrogate.
//!
//! Each step feeds the current `[time, species(, parameters)]` row to the
//! network as a length-1 sequence from a zero recurrent state and takes the
//! predicted mean as the next species state. The predicted spread is not
//! sampled, so a rollout is a pure function of the weights and the initial
//! condition.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::dataset::{GenerationOutcome, GenerationStatus, TrajectoryTensor};
use crate::monitor::{RunMonitor, Unmonitored};
use crate::randomize::{InitialConditionSet, ParameterPerturbationSet};
use crate::surrogate::MdnNetwork;
use crate::{ensure_len, CrnError, Result};

/// How predicted means become the next state.
///
/// The rounded value is both stored in the trajectory and fed back as the
/// next step's input, so the network only ever sees states a trajectory
/// could hold. Use `Continuous` to feed back the raw mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    /// Round half away from zero, emulating molecule counts.
    #[default]
    Nearest,
    /// As `Nearest`, then clamp at zero.
    NearestNonNegative,
    /// Keep the raw mean.
    Continuous,
}

impl RoundingPolicy {
    pub fn apply(self, value: f64) -> f64 {
        match self {
            RoundingPolicy::Nearest => value.round(),
            RoundingPolicy::NearestNonNegative => value.round().max(0.0),
            RoundingPolicy::Continuous => value,
        }
    }
}

pub struct AutoregressiveSampler<'a> {
    network: &'a MdnNetwork,
    species: Vec<String>,
    parameters: Option<ParameterPerturbationSet>,
    rounding: RoundingPolicy,
}

impl<'a> AutoregressiveSampler<'a> {
    /// `species` is the column order the network was trained on.
    pub fn new(network: &'a MdnNetwork, species: Vec<String>, rounding: RoundingPolicy) -> Result<Self> {
        ensure_len("sampler species", network.architecture().n_species, species.len())?;
        Ok(Self {
            network,
            species,
            parameters: None,
            rounding,
        })
    }

    /// Constant parameter columns for networks trained with them.
    ///
    /// Either one row shared by every condition or one row per condition.
    pub fn with_parameters(mut self, parameters: ParameterPerturbationSet) -> Result<Self> {
        ensure_len(
            "sampler parameter columns",
            self.network.architecture().n_parameter_columns(),
            parameters.names().len(),
        )?;
        self.parameters = Some(parameters);
        Ok(self)
    }

    pub fn rounding(&self) -> RoundingPolicy {
        self.rounding
    }

    pub fn simulate(
        &self,
        conditions: &InitialConditionSet,
        time_step: f64,
        n_steps: usize,
        n_sims_per_condition: usize,
    ) -> Result<TrajectoryTensor> {
        let outcome = self.simulate_monitored(
            conditions,
            time_step,
            n_steps,
            n_sims_per_condition,
            &mut Unmonitored,
        )?;
        Ok(outcome.tensor)
    }

    /// Like [`simulate`](Self::simulate), checking for cancellation before
    /// each condition.
    pub fn simulate_monitored<M>(
        &self,
        conditions: &InitialConditionSet,
        time_step: f64,
        n_steps: usize,
        n_sims_per_condition: usize,
        monitor: &mut M,
    ) -> Result<GenerationOutcome>
    where
        M: RunMonitor + ?Sized,
    {
        if conditions.is_empty() {
            return Err(CrnError::EmptyDataset("no initial conditions to roll out".to_string()));
        }
        if !(time_step.is_finite() && time_step > 0.0) {
            return Err(CrnError::InvalidConfig(format!(
                "time_step must be positive, got {time_step}"
            )));
        }
        if n_sims_per_condition == 0 {
            return Err(CrnError::InvalidConfig(
                "n_sims_per_condition must be >= 1".to_string(),
            ));
        }
        let n_param_columns = self.network.architecture().n_parameter_columns();
        match &self.parameters {
            None if n_param_columns > 0 => {
                return Err(CrnError::Validation(format!(
                    "network expects {n_param_columns} parameter columns but none were given"
                )));
            }
            Some(params) if params.len() != 1 && params.len() != conditions.len() => {
                return Err(CrnError::LengthMismatch {
                    context: "sampler parameter rows",
                    expected: conditions.len(),
                    got: params.len(),
                });
            }
            _ => {}
        }

        let mut variable_names = vec!["time".to_string()];
        variable_names.extend(self.species.iter().cloned());
        let mut tensor = TrajectoryTensor::new(variable_names, n_steps + 1);
        let n_conditions = conditions.len();
        info!(
            "rolling out {} conditions x {} replicates for {} steps",
            n_conditions, n_sims_per_condition, n_steps
        );

        monitor.set_progress(0.0);
        for cond in 0..n_conditions {
            if monitor.is_canceled() {
                warn!("rollout canceled after {cond} of {n_conditions} conditions");
                return Ok(GenerationOutcome {
                    tensor,
                    status: GenerationStatus::Partial {
                        conditions_completed: cond,
                    },
                });
            }

            let initial = conditions.ordered_row(cond, &self.species)?;
            let extra = match &self.parameters {
                Some(params) => params.row(if params.len() == 1 { 0 } else { cond }).to_vec(),
                None => Vec::new(),
            };
            let rollout = self.rollout(&initial, &extra, time_step, n_steps)?;
            // rollouts are deterministic, so every replicate is the same path
            for _ in 0..n_sims_per_condition {
                tensor.push_flat(&rollout)?;
            }
            monitor.set_progress((cond + 1) as f64 / n_conditions as f64);
        }

        Ok(GenerationOutcome {
            tensor,
            status: GenerationStatus::Complete,
        })
    }

    /// One flattened `(n_steps + 1) x (1 + n_species)` path.
    fn rollout(&self, initial: &[f64], extra: &[f64], time_step: f64, n_steps: usize) -> Result<Vec<f64>> {
        let width = 1 + initial.len();
        let mut path = Vec::with_capacity((n_steps + 1) * width);
        let mut input = Vec::with_capacity(width + extra.len());
        input.push(0.0);
        input.extend_from_slice(initial);
        input.extend_from_slice(extra);
        path.extend_from_slice(&input[..width]);

        for step in 1..=n_steps {
            let prediction = self.network.predict_step(&input)?;
            input[0] = step as f64 * time_step;
            for (slot, mu) in input[1..width].iter_mut().zip(prediction.mu.iter()) {
                *slot = self.rounding.apply(*mu);
            }
            path.extend_from_slice(&input[..width]);
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::{Device, SurrogateConfig};
    use crate::monitor::Hooks;
    use crate::surrogate::Architecture;

    fn network(n_params: usize) -> MdnNetwork {
        let config = SurrogateConfig {
            hidden_size: 5,
            num_layers: 2,
            device: Device::Cpu,
            init_seed: 21,
        };
        MdnNetwork::new(Architecture::for_dataset(2, n_params, &config), &config).unwrap()
    }

    fn conditions() -> InitialConditionSet {
        InitialConditionSet::new(
            vec!["A".to_string(), "B".to_string()],
            vec![vec![10.0, 0.0], vec![3.0, 7.0]],
        )
        .unwrap()
    }

    #[test]
    fn rounding_policies() {
        assert_eq!(RoundingPolicy::Nearest.apply(-0.6), -1.0);
        assert_eq!(RoundingPolicy::NearestNonNegative.apply(-0.6), 0.0);
        assert_eq!(RoundingPolicy::Nearest.apply(2.5), 3.0);
        assert_eq!(RoundingPolicy::Continuous.apply(1.25), 1.25);
    }

    #[test]
    fn repeated_rollouts_are_identical() {
        let net = network(0);
        let sampler = AutoregressiveSampler::new(&net, vec!["A".into(), "B".into()], RoundingPolicy::Nearest).unwrap();
        let first = sampler.simulate(&conditions(), 0.5, 6, 2).unwrap();
        let second = sampler.simulate(&conditions(), 0.5, 6, 2).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.shape(), (4, 7, 3));
    }

    #[test]
    fn first_row_is_initial_state_and_later_rows_are_rounded() {
        let net = network(0);
        let sampler = AutoregressiveSampler::new(&net, vec!["A".into(), "B".into()], RoundingPolicy::Nearest).unwrap();
        let tensor = sampler.simulate(&conditions(), 0.25, 4, 1).unwrap();

        assert_eq!(tensor.point(1, 0), &[0.0, 3.0, 7.0]);
        for t in 1..=4 {
            let row = tensor.point(0, t);
            assert_eq!(row[0], t as f64 * 0.25);
            assert!(row[1..].iter().all(|v| v.fract() == 0.0));
        }
    }

    #[test]
    fn rounded_state_is_fed_back() {
        let net = network(0);
        let sampler = AutoregressiveSampler::new(&net, vec!["A".into(), "B".into()], RoundingPolicy::Nearest).unwrap();
        let tensor = sampler.simulate(&conditions(), 0.25, 2, 1).unwrap();

        let first = net.predict_step(&[0.0, 10.0, 0.0]).unwrap();
        let row1: Vec<f64> = std::iter::once(0.25)
            .chain(first.mu.iter().map(|m| m.round()))
            .collect();
        assert_eq!(tensor.point(0, 1), row1.as_slice());

        let second = net.predict_step(&row1).unwrap();
        let row2: Vec<f64> = second.mu.iter().map(|m| m.round()).collect();
        assert_eq!(&tensor.point(0, 2)[1..], row2.as_slice());
    }

    #[test]
    fn conditions_are_reordered_to_network_species() {
        let net = network(0);
        let sampler = AutoregressiveSampler::new(&net, vec!["B".into(), "A".into()], RoundingPolicy::Continuous).unwrap();
        let tensor = sampler.simulate(&conditions(), 1.0, 1, 1).unwrap();
        assert_eq!(tensor.variable_names(), &["time", "B", "A"]);
        assert_eq!(tensor.point(0, 0), &[0.0, 0.0, 10.0]);
    }

    #[test]
    fn parameter_columns_are_required_when_trained_with_them() {
        let net = network(1);
        let sampler = AutoregressiveSampler::new(&net, vec!["A".into(), "B".into()], RoundingPolicy::Nearest).unwrap();
        assert!(matches!(
            sampler.simulate(&conditions(), 1.0, 2, 1),
            Err(CrnError::Validation(_))
        ));

        let params = ParameterPerturbationSet::new(vec!["k".into()], vec![vec![0.3]]).unwrap();
        let sampler = sampler.with_parameters(params).unwrap();
        let tensor = sampler.simulate(&conditions(), 1.0, 2, 1).unwrap();
        assert_eq!(tensor.n_vars(), 3);
    }

    #[test]
    fn cancel_before_second_condition_gives_partial() {
        let net = network(0);
        let sampler = AutoregressiveSampler::new(&net, vec!["A".into(), "B".into()], RoundingPolicy::Nearest).unwrap();
        let polls = Cell::new(0);
        let mut monitor = Hooks::new(
            |_| {},
            || {
                polls.set(polls.get() + 1);
                polls.get() > 1
            },
        );
        let outcome = sampler.simulate_monitored(&conditions(), 1.0, 3, 2, &mut monitor).unwrap();
        assert_eq!(outcome.status, GenerationStatus::Partial { conditions_completed: 1 });
        assert_eq!(outcome.tensor.n_samples(), 2);
    }

    #[test]
    fn rejects_non_positive_step() {
        let net = network(0);
        let sampler = AutoregressiveSampler::new(&net, vec!["A".into(), "B".into()], RoundingPolicy::Nearest).unwrap();
        assert!(sampler.simulate(&conditions(), 0.0, 3, 1).is_err());
    }
}
