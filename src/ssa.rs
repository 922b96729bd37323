//! Gillespie direct-method stochastic simulation.
//!
//! Values live in one flat table laid out as
//! `[floating species | boundary species | parameters]`; rate laws are bound
//! to slots in that table once, when the network is compiled.

use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, Exp};

use crate::network::NetworkDefinition;
use crate::{CrnError, Result};

#[derive(Debug, Clone)]
struct CompiledReaction {
    propensity: crate::network::expr::BoundExpr,
    /// (floating species slot, required count) for every reactant
    requires: Vec<(usize, f64)>,
    /// (floating species slot, net change); boundary species never change
    delta: Vec<(usize, f64)>,
}

#[derive(Debug, Clone)]
pub struct CompiledNetwork {
    names: Vec<String>,
    n_species: usize,
    n_boundary: usize,
    reactions: Vec<CompiledReaction>,
}

impl CompiledNetwork {
    pub fn compile(definition: &NetworkDefinition) -> Result<Self> {
        let floating = definition.species_names();
        let boundary = definition.boundary_species_names();
        let params = definition.parameter_names();

        let names: Vec<String> = floating
            .iter()
            .chain(&boundary)
            .chain(&params)
            .cloned()
            .collect();
        let slot = |name: &str| names.iter().position(|n| n == name);
        let n_species = floating.len();

        let mut reactions = Vec::with_capacity(definition.reactions.len());
        for reaction in &definition.reactions {
            let propensity = reaction
                .rate_law
                .expr()
                .bind(&slot)
                .map_err(|name| CrnError::UnknownName {
                    kind: "rate law identifier",
                    name,
                })?;

            let mut requires = Vec::new();
            for term in &reaction.reactants {
                let idx = slot(&term.species).ok_or_else(|| CrnError::UnknownName {
                    kind: "species",
                    name: term.species.clone(),
                })?;
                if idx < n_species {
                    requires.push((idx, term.stoichiometry as f64));
                }
            }

            let mut delta = Vec::new();
            for (name, change) in reaction.net_change() {
                let idx = slot(name).ok_or_else(|| CrnError::UnknownName {
                    kind: "species",
                    name: name.to_string(),
                })?;
                if idx < n_species && change != 0 {
                    delta.push((idx, change as f64));
                }
            }

            reactions.push(CompiledReaction {
                propensity,
                requires,
                delta,
            });
        }

        Ok(Self {
            names,
            n_species,
            n_boundary: boundary.len(),
            reactions,
        })
    }

    /// Slot names in table order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn n_boundary(&self) -> usize {
        self.n_boundary
    }

    pub fn n_reactions(&self) -> usize {
        self.reactions.len()
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Fills `out` with the propensity of every reaction and returns their sum.
    ///
    /// A reaction whose reactants are not all present has propensity zero, and
    /// negative rate-law values are clamped to zero.
    pub fn propensities(&self, values: &[f64], out: &mut [f64]) -> Result<f64> {
        let mut total = 0.0;
        for (slot, reaction) in out.iter_mut().zip(&self.reactions) {
            let feasible = reaction
                .requires
                .iter()
                .all(|(idx, count)| values[*idx] >= *count);
            let rate = if feasible {
                reaction.propensity.eval(values)
            } else {
                0.0
            };
            if rate.is_nan() {
                return Err(CrnError::Validation(
                    "rate law evaluated to NaN".to_string(),
                ));
            }
            *slot = rate.max(0.0);
            total += *slot;
        }

        if !total.is_finite() {
            return Err(CrnError::Validation(format!(
                "total propensity diverged ({total})"
            )));
        }
        Ok(total)
    }

    fn fire(&self, reaction: usize, values: &mut [f64]) {
        for (idx, change) in &self.reactions[reaction].delta {
            values[*idx] += *change;
        }
    }

    /// Runs one trajectory, advancing `values` to the state at `end`.
    ///
    /// Returns an `(n_steps + 1) x (1 + n_species)` matrix sampled on the
    /// uniform grid `start + i * (end - start) / n_steps`. Row 0 is the
    /// initial state and column 0 is time; between events the state is
    /// piecewise constant.
    pub fn simulate<R: Rng + ?Sized>(
        &self,
        values: &mut [f64],
        start: f64,
        end: f64,
        n_steps: usize,
        rng: &mut R,
    ) -> Result<DMatrix<f64>> {
        crate::ensure_len("value table", self.names.len(), values.len())?;
        if n_steps == 0 || !(end > start) {
            return Err(CrnError::InvalidConfig(format!(
                "invalid simulation window [{start}, {end}] with {n_steps} steps"
            )));
        }

        let dt = (end - start) / n_steps as f64;
        let grid = |i: usize| if i == n_steps { end } else { start + i as f64 * dt };

        let mut out = DMatrix::<f64>::zeros(n_steps + 1, 1 + self.n_species);
        let record = |out: &mut DMatrix<f64>, row: usize, values: &[f64]| {
            out[(row, 0)] = grid(row);
            for s in 0..self.n_species {
                out[(row, 1 + s)] = values[s];
            }
        };

        record(&mut out, 0, values);
        let mut next_row = 1;
        let mut t = start;
        let mut rates = vec![0.0; self.reactions.len()];

        while next_row <= n_steps {
            let total = self.propensities(values, &mut rates)?;
            if total <= 0.0 {
                // absorbing state: nothing fires for the rest of the window
                while next_row <= n_steps {
                    record(&mut out, next_row, values);
                    next_row += 1;
                }
                break;
            }

            let waiting = Exp::new(total)
                .map_err(|e| CrnError::Validation(format!("waiting-time distribution: {e}")))?;
            let t_next = t + waiting.sample(rng);

            while next_row <= n_steps && grid(next_row) < t_next {
                record(&mut out, next_row, values);
                next_row += 1;
            }
            if next_row > n_steps {
                break;
            }

            let target = rng.gen::<f64>() * total;
            let mut cumulative = 0.0;
            let mut chosen = rates.iter().rposition(|r| *r > 0.0).unwrap_or(0);
            for (idx, rate) in rates.iter().enumerate() {
                cumulative += rate;
                if target < cumulative {
                    chosen = idx;
                    break;
                }
            }
            self.fire(chosen, values);
            t = t_next;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn compile(text: &str) -> (CompiledNetwork, Vec<f64>) {
        let def = NetworkDefinition::parse(text).unwrap();
        let net = CompiledNetwork::compile(&def).unwrap();
        let values = net
            .names()
            .iter()
            .map(|n| {
                def.species(n)
                    .map(|s| s.initial)
                    .or_else(|| def.parameter(n).map(|p| p.value))
                    .unwrap()
            })
            .collect();
        (net, values)
    }

    #[test]
    fn output_grid_and_initial_row() {
        let (net, mut values) = compile("decay: A -> ; k*A\nA = 100\nk = 0.1");
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let traj = net.simulate(&mut values, 0.0, 10.0, 20, &mut rng).unwrap();

        assert_eq!(traj.shape(), (21, 2));
        assert_eq!(traj[(0, 0)], 0.0);
        assert_eq!(traj[(0, 1)], 100.0);
        assert_eq!(traj[(20, 0)], 10.0);
        assert!((traj[(1, 0)] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn pure_decay_is_monotone_and_integral() {
        let (net, mut values) = compile("decay: A -> ; k*A\nA = 50\nk = 0.5");
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let traj = net.simulate(&mut values, 0.0, 20.0, 40, &mut rng).unwrap();

        for row in 1..traj.nrows() {
            let count = traj[(row, 1)];
            assert_eq!(count, count.round());
            assert!(count >= 0.0);
            assert!(count <= traj[(row - 1, 1)]);
        }
        assert_eq!(values[0], traj[(40, 1)]);
    }

    #[test]
    fn conserved_total_under_isomerization() {
        let (net, mut values) = compile("f: A -> B; k1*A\nr: B -> A; k2*B\nA = 30\nB = 10\nk1 = 1\nk2 = 2");
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let traj = net.simulate(&mut values, 0.0, 5.0, 50, &mut rng).unwrap();
        for row in 0..traj.nrows() {
            assert_eq!(traj[(row, 1)] + traj[(row, 2)], 40.0);
        }
    }

    #[test]
    fn boundary_species_stay_constant_and_unreported() {
        let (net, mut values) = compile("species $S, X\nmake: $S -> X; k*S\nS = 3\nX = 0\nk = 1");
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let traj = net.simulate(&mut values, 0.0, 5.0, 10, &mut rng).unwrap();
        assert_eq!(traj.ncols(), 2);
        assert_eq!(values[net.slot("S").unwrap()], 3.0);
        assert!(traj[(10, 1)] > 0.0);
    }

    #[test]
    fn constant_rate_cannot_drive_counts_negative() {
        let (net, mut values) = compile("drain: A -> ; k\nA = 3\nk = 100");
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let traj = net.simulate(&mut values, 0.0, 10.0, 10, &mut rng).unwrap();
        assert_eq!(traj[(10, 1)], 0.0);
    }

    #[test]
    fn same_seed_same_trajectory() {
        let (net, values) = compile("f: A -> B; k*A\nA = 40\nB = 0\nk = 0.3");
        let run = |seed| {
            let mut v = values.clone();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            net.simulate(&mut v, 0.0, 10.0, 25, &mut rng).unwrap()
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn rejects_empty_window() {
        let (net, mut values) = compile("f: A -> ; k*A\nA = 1\nk = 1");
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(net.simulate(&mut values, 1.0, 1.0, 10, &mut rng).is_err());
        assert!(net.simulate(&mut values, 0.0, 1.0, 0, &mut rng).is_err());
    }
}
