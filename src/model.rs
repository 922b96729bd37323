use std::path::Path;

use log::debug;
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::network::{read_definition, NetworkDefinition};
use crate::ssa::CompiledNetwork;
use crate::{CrnError, Result};

/// Stochastic solver seam used by dataset generation.
///
/// `simulate` returns an `(n_steps + 1) x (1 + n_species)` matrix whose first
/// column is time and whose first row is the state the solver held when the
/// call began.
pub trait ReactionSolver {
    /// Floating species, in the column order used by `simulate`.
    fn species_names(&self) -> &[String];

    fn parameter_names(&self) -> &[String];

    /// Current value of every species and parameter, species first.
    fn get_values(&self) -> Vec<(String, f64)>;

    /// Assigns one species count or parameter value.
    fn assign(&mut self, name: &str, value: f64) -> Result<()>;

    fn set_values(&mut self, values: &[(String, f64)]) -> Result<()> {
        for (name, value) in values {
            self.assign(name, *value)?;
        }
        Ok(())
    }

    /// Restores every value to the nominal one from the definition.
    fn reset(&mut self);

    fn simulate(&mut self, start: f64, end: f64, n_steps: usize) -> Result<DMatrix<f64>>;

    /// Current species values only, in species order.
    fn species_values(&self) -> Vec<(String, f64)> {
        let values = self.get_values();
        self.species_names()
            .iter()
            .filter_map(|name| values.iter().find(|(n, _)| n == name).cloned())
            .collect()
    }

    /// Current parameter values only, in parameter order.
    fn parameter_values(&self) -> Vec<(String, f64)> {
        let values = self.get_values();
        self.parameter_names()
            .iter()
            .filter_map(|name| values.iter().find(|(n, _)| n == name).cloned())
            .collect()
    }
}

/// Exact stochastic model of a reaction network.
///
/// Holds both the nominal values from the definition and the current
/// working values; [`ReactionSolver::reset`] copies the former over the
/// latter and leaves the random stream untouched.
#[derive(Debug, Clone)]
pub struct GillespieModel {
    definition_text: String,
    definition: NetworkDefinition,
    network: CompiledNetwork,
    species_names: Vec<String>,
    parameter_names: Vec<String>,
    nominal: Vec<f64>,
    values: Vec<f64>,
    rng: ChaCha8Rng,
}

impl GillespieModel {
    /// Builds a model from rule text or JSON exchange text.
    pub fn load(definition_text: &str) -> Result<Self> {
        let definition = NetworkDefinition::parse(definition_text)?;
        Self::from_definition(definition, definition_text.to_string())
    }

    /// Builds a model from a `.txt`, `.ant` or `.json` definition file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let (definition, text) = read_definition(path)?;
        Self::from_definition(definition, text)
    }

    pub fn from_definition(definition: NetworkDefinition, definition_text: String) -> Result<Self> {
        let network = CompiledNetwork::compile(&definition)?;

        let mut nominal = Vec::with_capacity(network.names().len());
        for name in network.names() {
            let value = definition
                .species(name)
                .map(|s| s.initial)
                .or_else(|| definition.parameter(name).map(|p| p.value))
                .ok_or_else(|| CrnError::UnknownName {
                    kind: "name",
                    name: name.clone(),
                })?;
            nominal.push(value);
        }

        debug!(
            "compiled network: {} species, {} boundary, {} parameters, {} reactions",
            network.n_species(),
            network.n_boundary(),
            definition.parameters.len(),
            network.n_reactions()
        );

        Ok(Self {
            species_names: definition.species_names(),
            parameter_names: definition.parameter_names(),
            definition_text,
            definition,
            network,
            values: nominal.clone(),
            nominal,
            rng: ChaCha8Rng::from_entropy(),
        })
    }

    /// Fixes the random stream; 0 leaves the solver entropy-seeded.
    ///
    /// The stream keeps advancing across `simulate` and `reset` calls, so
    /// replicates after a reset differ while a whole run stays reproducible.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = if seed == 0 {
            ChaCha8Rng::from_entropy()
        } else {
            ChaCha8Rng::seed_from_u64(seed)
        };
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.set_seed(seed);
        self
    }

    pub fn definition(&self) -> &NetworkDefinition {
        &self.definition
    }

    pub fn definition_text(&self) -> &str {
        &self.definition_text
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.network.slot(name).map(|idx| self.values[idx])
    }
}

impl ReactionSolver for GillespieModel {
    fn species_names(&self) -> &[String] {
        &self.species_names
    }

    fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    fn get_values(&self) -> Vec<(String, f64)> {
        let n_species = self.network.n_species();
        let n_boundary = self.network.n_boundary();
        self.network
            .names()
            .iter()
            .zip(&self.values)
            .enumerate()
            .filter(|(idx, _)| *idx < n_species || *idx >= n_species + n_boundary)
            .map(|(_, (name, value))| (name.clone(), *value))
            .collect()
    }

    fn assign(&mut self, name: &str, value: f64) -> Result<()> {
        let idx = self.network.slot(name).ok_or_else(|| CrnError::UnknownName {
            kind: "species or parameter",
            name: name.to_string(),
        })?;
        if !value.is_finite() {
            return Err(CrnError::Validation(format!(
                "value for '{name}' must be finite, got {value}"
            )));
        }
        self.values[idx] = value;
        Ok(())
    }

    fn reset(&mut self) {
        self.values.copy_from_slice(&self.nominal);
    }

    fn simulate(&mut self, start: f64, end: f64, n_steps: usize) -> Result<DMatrix<f64>> {
        self.network
            .simulate(&mut self.values, start, end, n_steps, &mut self.rng)
    }
}
