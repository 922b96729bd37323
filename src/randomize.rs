//! Randomization of initial conditions and rate parameters around nominal values.

use std::marker::PhantomData;

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::RandomizationConfig;
use crate::{CrnError, Result};

/// Column labels for [`InitialConditionSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeciesValues {}

/// Column labels for [`ParameterPerturbationSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterValues {}

/// Immutable table of named values, one row per condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ValueTable<K> {
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
    #[serde(skip)]
    kind: PhantomData<K>,
}

pub type InitialConditionSet = ValueTable<SpeciesValues>;
pub type ParameterPerturbationSet = ValueTable<ParameterValues>;

impl<K> ValueTable<K> {
    pub fn new(names: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        for row in &rows {
            crate::ensure_len("condition row", names.len(), row.len())?;
        }
        Ok(Self {
            names,
            rows,
            kind: PhantomData,
        })
    }

    /// One condition holding the given values.
    pub fn single(values: &[(String, f64)]) -> Self {
        Self {
            names: values.iter().map(|(n, _)| n.clone()).collect(),
            rows: vec![values.iter().map(|(_, v)| *v).collect()],
            kind: PhantomData,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        &self.rows[idx]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.rows.iter().map(Vec::as_slice)
    }

    pub fn value(&self, idx: usize, name: &str) -> Option<f64> {
        let col = self.names.iter().position(|n| n == name)?;
        self.rows.get(idx).map(|row| row[col])
    }

    /// Name/value pairs for one condition, ready for `ReactionSolver::set_values`.
    pub fn assignments(&self, idx: usize) -> Vec<(String, f64)> {
        self.names
            .iter()
            .cloned()
            .zip(self.rows[idx].iter().copied())
            .collect()
    }

    /// Values of one condition reordered to `order`.
    pub fn ordered_row(&self, idx: usize, order: &[String]) -> Result<Vec<f64>> {
        order
            .iter()
            .map(|name| {
                self.value(idx, name).ok_or_else(|| CrnError::UnknownName {
                    kind: "condition column",
                    name: name.clone(),
                })
            })
            .collect()
    }
}

/// Draws perturbed conditions from an injected random source.
pub struct Randomizer<R: Rng> {
    rng: R,
}

impl Randomizer<ChaCha8Rng> {
    /// Seeded ChaCha stream; 0 means entropy-seeded.
    pub fn from_seed(seed: u64) -> Self {
        let rng = if seed == 0 {
            ChaCha8Rng::from_entropy()
        } else {
            ChaCha8Rng::seed_from_u64(seed)
        };
        Self { rng }
    }
}

impl<R: Rng> Randomizer<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Perturbs nominal species counts into `n_conditions` initial conditions.
    ///
    /// Nonzero counts are drawn uniformly within `range_percentage` of the
    /// nominal value. Zero counts are replaced, with probability
    /// `zero_perturb_prob`, by a uniform draw from `zero_perturb_range`.
    /// Every drawn value is rounded to a whole count.
    pub fn randomize_initial_conditions(
        &mut self,
        nominal: &[(String, f64)],
        n_conditions: usize,
        range_percentage: f64,
        zero_perturb_prob: f64,
        zero_perturb_range: (f64, f64),
    ) -> Result<InitialConditionSet> {
        check_unit("range_percentage", range_percentage)?;
        check_unit("zero_perturb_prob", zero_perturb_prob)?;
        let (low, high) = zero_perturb_range;
        if !(low.is_finite() && high.is_finite() && low <= high) {
            return Err(CrnError::InvalidConfig(format!(
                "zero_perturb_range ({low}, {high}) must satisfy low <= high"
            )));
        }

        let mut rows = Vec::with_capacity(n_conditions);
        for _ in 0..n_conditions {
            let row = nominal
                .iter()
                .map(|(_, value)| {
                    if *value == 0.0 {
                        if self.rng.gen_bool(zero_perturb_prob) {
                            self.rng.gen_range(low..=high).round().clamp(low, high)
                        } else {
                            0.0
                        }
                    } else {
                        self.perturb(*value, range_percentage).round()
                    }
                })
                .collect();
            rows.push(row);
        }

        debug!(
            "randomized {} initial conditions over {} species",
            n_conditions,
            nominal.len()
        );
        ValueTable::new(nominal.iter().map(|(n, _)| n.clone()).collect(), rows)
    }

    /// Perturbs one parameter per condition, round-robin.
    ///
    /// Condition `i` draws parameter `i % n_parameters` uniformly within
    /// `range_percentage` of its nominal value and keeps the others nominal.
    /// Parameter values are not rounded.
    pub fn randomize_parameters(
        &mut self,
        nominal: &[(String, f64)],
        n_conditions: usize,
        range_percentage: f64,
    ) -> Result<ParameterPerturbationSet> {
        check_unit("range_percentage", range_percentage)?;

        let names: Vec<String> = nominal.iter().map(|(n, _)| n.clone()).collect();
        if nominal.is_empty() {
            return ValueTable::new(names, vec![Vec::new(); n_conditions]);
        }

        let mut rows = Vec::with_capacity(n_conditions);
        for i in 0..n_conditions {
            let mut row: Vec<f64> = nominal.iter().map(|(_, v)| *v).collect();
            let target = i % nominal.len();
            row[target] = self.perturb(row[target], range_percentage);
            rows.push(row);
        }
        ValueTable::new(names, rows)
    }

    /// Both tables for one dataset, driven by a [`RandomizationConfig`].
    pub fn randomize(
        &mut self,
        config: &RandomizationConfig,
        species: &[(String, f64)],
        parameters: &[(String, f64)],
        n_conditions: usize,
    ) -> Result<(InitialConditionSet, Option<ParameterPerturbationSet>)> {
        config.validate()?;
        let conditions = self.randomize_initial_conditions(
            species,
            n_conditions,
            config.range_percentage,
            config.zero_perturb_prob,
            config.zero_perturb_range,
        )?;
        let parameters = if config.perturb_parameters {
            Some(self.randomize_parameters(
                parameters,
                n_conditions,
                config.parameter_range_percentage,
            )?)
        } else {
            None
        };
        Ok((conditions, parameters))
    }

    fn perturb(&mut self, value: f64, range_percentage: f64) -> f64 {
        let a = value * (1.0 - range_percentage);
        let b = value * (1.0 + range_percentage);
        // negative nominal values flip the bounds
        self.rng.gen_range(a.min(b)..=a.max(b))
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CrnError::InvalidConfig(format!("{name} must be in [0, 1], got {value}")))
    }
}
