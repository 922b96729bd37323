//! Mixture-density recurrent surrogate.
//!
//! A stacked LSTM reads `[time, species(, parameters)]` one step at a time.
//! Its top hidden state passes through two ReLU layers and a head that emits,
//! per species, a mean and a raw scale whose exponential is the standard
//! deviation.

pub mod adam;
pub mod dense;
pub mod loss;
pub mod lstm;

use std::fs;
use std::path::Path;

use nalgebra::DVector;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Device, SurrogateConfig};
use crate::{ensure_len, CrnError, Result};
use adam::Adam;
use dense::Dense;
use loss::{gaussian_nll, gaussian_nll_grad};
use lstm::{LstmLayer, StepCache};

/// Network dimensions; fixed once a model is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub n_species: usize,
}

impl Architecture {
    /// Input is time plus species plus any constant parameter columns.
    pub fn for_dataset(n_species: usize, n_parameter_columns: usize, config: &SurrogateConfig) -> Self {
        Self {
            input_size: 1 + n_species + n_parameter_columns,
            hidden_size: config.hidden_size,
            num_layers: config.num_layers,
            n_species,
        }
    }

    pub fn output_size(&self) -> usize {
        2 * self.n_species
    }

    pub fn n_parameter_columns(&self) -> usize {
        self.input_size.saturating_sub(1 + self.n_species)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_species == 0 {
            return Err(CrnError::InvalidConfig("n_species must be >= 1".to_string()));
        }
        if self.input_size < 1 + self.n_species {
            return Err(CrnError::InvalidConfig(format!(
                "input_size {} cannot hold time and {} species",
                self.input_size, self.n_species
            )));
        }
        if self.hidden_size == 0 || self.num_layers == 0 {
            return Err(CrnError::InvalidConfig(
                "hidden_size and num_layers must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Tensor names and `(rows, cols)` shapes in canonical order.
    pub fn tensor_layout(&self) -> Vec<(String, (usize, usize))> {
        let h = self.hidden_size;
        let mut layout = Vec::new();
        for layer in 0..self.num_layers {
            let in_size = if layer == 0 { self.input_size } else { h };
            layout.push((format!("lstm.weight_ih_l{layer}"), (4 * h, in_size)));
            layout.push((format!("lstm.weight_hh_l{layer}"), (4 * h, h)));
            layout.push((format!("lstm.bias_l{layer}"), (4 * h, 1)));
        }
        layout.push(("fc1.weight".to_string(), (h, h)));
        layout.push(("fc1.bias".to_string(), (h, 1)));
        layout.push(("fc2.weight".to_string(), (h, h)));
        layout.push(("fc2.bias".to_string(), (h, 1)));
        layout.push(("fc_out.weight".to_string(), (self.output_size(), h)));
        layout.push(("fc_out.bias".to_string(), (self.output_size(), 1)));
        layout
    }
}

/// One named tensor stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

/// Trained parameters, independent of the training code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateWeights {
    pub tensors: Vec<NamedTensor>,
}

impl SurrogateWeights {
    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Per-step output of the head.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mu: DVector<f64>,
    pub sigma: DVector<f64>,
}

struct HeadCache {
    z1: DVector<f64>,
    a1: DVector<f64>,
    z2: DVector<f64>,
    a2: DVector<f64>,
    mu: DVector<f64>,
    log_sigma: DVector<f64>,
}

fn relu(v: &DVector<f64>) -> DVector<f64> {
    v.map(|x| x.max(0.0))
}

fn relu_backward(pre: &DVector<f64>, grad: &DVector<f64>) -> DVector<f64> {
    pre.zip_map(grad, |z, g| if z > 0.0 { g } else { 0.0 })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MdnNetwork {
    architecture: Architecture,
    device: Device,
    lstm: Vec<LstmLayer>,
    fc1: Dense,
    fc2: Dense,
    head: Dense,
}

impl MdnNetwork {
    pub fn new(architecture: Architecture, config: &SurrogateConfig) -> Result<Self> {
        architecture.validate()?;
        let mut rng = if config.init_seed == 0 {
            ChaCha8Rng::from_entropy()
        } else {
            ChaCha8Rng::seed_from_u64(config.init_seed)
        };

        let h = architecture.hidden_size;
        let lstm = (0..architecture.num_layers)
            .map(|layer| {
                let in_size = if layer == 0 { architecture.input_size } else { h };
                LstmLayer::new(in_size, h, &mut rng)
            })
            .collect();

        Ok(Self {
            architecture,
            device: config.device,
            lstm,
            fc1: Dense::new(h, h, &mut rng),
            fc2: Dense::new(h, h, &mut rng),
            head: Dense::new(h, architecture.output_size(), &mut rng),
        })
    }

    /// Same shapes with every parameter zero; used as a gradient buffer.
    pub(crate) fn zeros_like(&self) -> Self {
        let arch = self.architecture;
        let h = arch.hidden_size;
        Self {
            architecture: arch,
            device: self.device,
            lstm: self
                .lstm
                .iter()
                .map(|layer| LstmLayer::zeros(layer.input_size(), h))
                .collect(),
            fc1: Dense::zeros(h, h),
            fc2: Dense::zeros(h, h),
            head: Dense::zeros(h, arch.output_size()),
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn run_lstm(&self, inputs: &[DVector<f64>]) -> (Vec<DVector<f64>>, Vec<Vec<StepCache>>) {
        let mut current = inputs.to_vec();
        let mut caches = Vec::with_capacity(self.lstm.len());
        for layer in &self.lstm {
            let (outputs, layer_cache) = layer.forward(&current);
            caches.push(layer_cache);
            current = outputs;
        }
        (current, caches)
    }

    fn run_head(&self, h: &DVector<f64>) -> HeadCache {
        let n = self.architecture.n_species;
        let z1 = self.fc1.forward(h);
        let a1 = relu(&z1);
        let z2 = self.fc2.forward(&a1);
        let a2 = relu(&z2);
        let out = self.head.forward(&a2);
        HeadCache {
            mu: out.rows(0, n).into_owned(),
            log_sigma: out.rows(n, n).into_owned(),
            z1,
            a1,
            z2,
            a2,
        }
    }

    /// Runs a sequence from a zero recurrent state.
    pub fn forward(&self, inputs: &[DVector<f64>]) -> Vec<Prediction> {
        let (tops, _) = self.run_lstm(inputs);
        tops.iter()
            .map(|h| {
                let head = self.run_head(h);
                Prediction {
                    sigma: head.log_sigma.map(f64::exp),
                    mu: head.mu,
                }
            })
            .collect()
    }

    /// Feeds one state as a length-1 sequence with a fresh zero state.
    pub fn predict_step(&self, input: &[f64]) -> Result<Prediction> {
        ensure_len("surrogate input", self.architecture.input_size, input.len())?;
        self.forward(&[DVector::from_column_slice(input)])
            .pop()
            .ok_or_else(|| CrnError::Validation("empty prediction".to_string()))
    }

    /// Summed NLL of a sequence fed its true states.
    pub fn sequence_nll(&self, inputs: &[DVector<f64>], targets: &[DVector<f64>]) -> f64 {
        let (tops, _) = self.run_lstm(inputs);
        tops.iter()
            .zip(targets)
            .map(|(h, y)| {
                let head = self.run_head(h);
                gaussian_nll(&head.mu, &head.log_sigma, y)
            })
            .sum()
    }

    /// Backpropagates one sequence, adding `scale * dL/dθ` into `grads`.
    ///
    /// Returns the unscaled summed NLL of the sequence.
    pub(crate) fn accumulate_gradients(
        &self,
        inputs: &[DVector<f64>],
        targets: &[DVector<f64>],
        scale: f64,
        grads: &mut MdnNetwork,
    ) -> f64 {
        let n = self.architecture.n_species;
        let (tops, caches) = self.run_lstm(inputs);

        let mut total = 0.0;
        let mut dh = Vec::with_capacity(tops.len());
        for (h, y) in tops.iter().zip(targets) {
            let head = self.run_head(h);
            total += gaussian_nll(&head.mu, &head.log_sigma, y);

            let (d_mu, d_s) = gaussian_nll_grad(&head.mu, &head.log_sigma, y);
            let mut d_out = DVector::zeros(2 * n);
            d_out.rows_mut(0, n).copy_from(&(d_mu * scale));
            d_out.rows_mut(n, n).copy_from(&(d_s * scale));

            let d_a2 = self.head.backward(&head.a2, &d_out, &mut grads.head);
            let d_z2 = relu_backward(&head.z2, &d_a2);
            let d_a1 = self.fc2.backward(&head.a1, &d_z2, &mut grads.fc2);
            let d_z1 = relu_backward(&head.z1, &d_a1);
            dh.push(self.fc1.backward(h, &d_z1, &mut grads.fc1));
        }

        for (idx, layer) in self.lstm.iter().enumerate().rev() {
            dh = layer.backward(&caches[idx], &dh, &mut grads.lstm[idx]);
        }
        total
    }

    fn slices(&self) -> Vec<&[f64]> {
        let mut out = Vec::new();
        for layer in &self.lstm {
            out.push(layer.w_ih.as_slice());
            out.push(layer.w_hh.as_slice());
            out.push(layer.bias.as_slice());
        }
        for dense in [&self.fc1, &self.fc2, &self.head] {
            out.push(dense.weight.as_slice());
            out.push(dense.bias.as_slice());
        }
        out
    }

    fn slices_mut(&mut self) -> Vec<&mut [f64]> {
        let mut out = Vec::new();
        for layer in &mut self.lstm {
            out.push(layer.w_ih.as_mut_slice());
            out.push(layer.w_hh.as_mut_slice());
            out.push(layer.bias.as_mut_slice());
        }
        for dense in [&mut self.fc1, &mut self.fc2, &mut self.head] {
            out.push(dense.weight.as_mut_slice());
            out.push(dense.bias.as_mut_slice());
        }
        out
    }

    pub(crate) fn apply_gradients(&mut self, optimizer: &mut Adam, grads: &MdnNetwork) {
        optimizer.step(self.slices_mut(), grads.slices());
    }

    pub fn parameter_count(&self) -> usize {
        self.slices().iter().map(|s| s.len()).sum()
    }

    /// Snapshot of every tensor, row-major, in canonical order.
    pub fn weights(&self) -> SurrogateWeights {
        let tensors = self
            .architecture
            .tensor_layout()
            .into_iter()
            .zip(self.slices())
            .map(|((name, (rows, cols)), col_major)| {
                let mut data = Vec::with_capacity(rows * cols);
                for r in 0..rows {
                    for c in 0..cols {
                        data.push(col_major[c * rows + r]);
                    }
                }
                NamedTensor {
                    name,
                    rows,
                    cols,
                    data,
                }
            })
            .collect();
        SurrogateWeights { tensors }
    }

    /// Replaces every parameter; nothing is written unless every tensor matches.
    pub fn load_weights(&mut self, weights: &SurrogateWeights) -> Result<()> {
        let layout = self.architecture.tensor_layout();
        if weights.tensors.len() != layout.len() {
            return Err(CrnError::ShapeMismatch {
                tensor: "weight tensor count".to_string(),
                expected: (layout.len(), 1),
                got: (weights.tensors.len(), 1),
            });
        }

        let mut sources = Vec::with_capacity(layout.len());
        for (name, shape) in &layout {
            let tensor = weights.get(name).ok_or_else(|| CrnError::UnknownName {
                kind: "weight tensor",
                name: name.clone(),
            })?;
            if (tensor.rows, tensor.cols) != *shape || tensor.data.len() != shape.0 * shape.1 {
                return Err(CrnError::ShapeMismatch {
                    tensor: name.clone(),
                    expected: *shape,
                    got: (tensor.rows, tensor.cols),
                });
            }
            sources.push(tensor);
        }

        for ((dest, tensor), (_, (rows, cols))) in self.slices_mut().into_iter().zip(sources).zip(&layout) {
            for r in 0..*rows {
                for c in 0..*cols {
                    dest[c * rows + r] = tensor.data[r * cols + c];
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(seed: u64) -> MdnNetwork {
        let config = SurrogateConfig {
            hidden_size: 4,
            num_layers: 2,
            device: Device::Cpu,
            init_seed: seed,
        };
        MdnNetwork::new(Architecture::for_dataset(2, 0, &config), &config).unwrap()
    }

    fn sequence() -> (Vec<DVector<f64>>, Vec<DVector<f64>>) {
        let inputs = vec![
            DVector::from_vec(vec![0.0, 1.0, 2.0]),
            DVector::from_vec(vec![0.5, 1.5, 1.0]),
        ];
        let targets = vec![
            DVector::from_vec(vec![1.5, 1.0]),
            DVector::from_vec(vec![2.0, 0.0]),
        ];
        (inputs, targets)
    }

    #[test]
    fn sigma_is_strictly_positive() {
        let net = small(1);
        let (inputs, _) = sequence();
        for pred in net.forward(&inputs) {
            assert_eq!(pred.mu.len(), 2);
            assert!(pred.sigma.iter().all(|s| *s > 0.0));
        }
    }

    #[test]
    fn layout_covers_every_parameter() {
        let net = small(2);
        let counted: usize = net
            .architecture()
            .tensor_layout()
            .iter()
            .map(|(_, (r, c))| r * c)
            .sum();
        assert_eq!(counted, net.parameter_count());
    }

    #[test]
    fn weights_round_trip_into_fresh_network() {
        let trained = small(3);
        let mut fresh = small(4);
        assert_ne!(trained, fresh);
        fresh.load_weights(&trained.weights()).unwrap();
        assert_eq!(trained, fresh);
    }

    #[test]
    fn mismatched_species_count_is_a_shape_error() {
        let trained = small(5);
        let config = SurrogateConfig {
            hidden_size: 4,
            num_layers: 2,
            device: Device::Cpu,
            init_seed: 6,
        };
        let mut other = MdnNetwork::new(Architecture::for_dataset(3, 0, &config), &config).unwrap();
        let before = other.clone();
        assert!(matches!(
            other.load_weights(&trained.weights()),
            Err(CrnError::ShapeMismatch { .. })
        ));
        assert_eq!(other, before);
    }

    #[test]
    fn extra_layers_are_a_shape_error() {
        let deep = small(8);
        let config = SurrogateConfig {
            hidden_size: 4,
            num_layers: 1,
            device: Device::Cpu,
            init_seed: 9,
        };
        let mut shallow = MdnNetwork::new(Architecture::for_dataset(2, 0, &config), &config).unwrap();
        let before = shallow.clone();
        assert!(matches!(
            shallow.load_weights(&deep.weights()),
            Err(CrnError::ShapeMismatch { expected: (9, 1), got: (12, 1), .. })
        ));
        assert_eq!(shallow, before);
        assert!(matches!(
            deep.clone().load_weights(&shallow.weights()),
            Err(CrnError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn predict_step_checks_input_width() {
        let net = small(7);
        assert!(net.predict_step(&[0.0, 1.0, 2.0]).is_ok());
        assert!(matches!(
            net.predict_step(&[0.0, 1.0]),
            Err(CrnError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn gradients_match_finite_difference() {
        let net = small(8);
        let (inputs, targets) = sequence();
        let mut grads = net.zeros_like();
        let loss = net.accumulate_gradients(&inputs, &targets, 1.0, &mut grads);
        assert!((loss - net.sequence_nll(&inputs, &targets)).abs() < 1e-12);

        let eps = 1e-6;
        let analytic = grads.slices().iter().map(|s| s.to_vec()).collect::<Vec<_>>();
        // probe one entry from every tensor
        for (tensor, grad) in analytic.iter().enumerate() {
            let idx = grad.len() / 2;
            let mut plus = net.clone();
            plus.slices_mut()[tensor][idx] += eps;
            let mut minus = net.clone();
            minus.slices_mut()[tensor][idx] -= eps;
            let numeric = (plus.sequence_nll(&inputs, &targets) - minus.sequence_nll(&inputs, &targets)) / (2.0 * eps);
            assert!(
                (numeric - grad[idx]).abs() < 1e-4 * (1.0 + numeric.abs()),
                "tensor {tensor}: numeric {numeric} analytic {}",
                grad[idx]
            );
        }
    }

    #[test]
    fn adam_steps_reduce_loss() {
        let mut net = small(9);
        let (inputs, targets) = sequence();
        let mut adam = Adam::new(1e-2);
        let start = net.sequence_nll(&inputs, &targets);
        for _ in 0..50 {
            let mut grads = net.zeros_like();
            net.accumulate_gradients(&inputs, &targets, 1.0, &mut grads);
            net.apply_gradients(&mut adam, &grads);
        }
        assert!(net.sequence_nll(&inputs, &targets) < start);
    }
}
