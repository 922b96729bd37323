//! One-step-ahead training of the surrogate on true states, with early stopping.
//!
//! Trajectories are split by index: the leading `train_fraction` share is
//! shuffled every epoch and fed in mini-batches, the rest is held out in its
//! original order. The held-out NLL (or the training NLL when nothing is held
//! out) is the monitored loss for early stopping and checkpointing.

use log::{info, warn};
use nalgebra::DVector;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::dataset::TrajectoryTensor;
use crate::monitor::RunMonitor;
use crate::surrogate::adam::Adam;
use crate::surrogate::{MdnNetwork, SurrogateWeights};
use crate::{CrnError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The monitored loss reached `target_loss`.
    Converged,
    /// `patience` epochs passed without improvement.
    EarlyStop,
    Cancelled,
    /// Every epoch ran.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
    Idle,
    Training { epoch: usize },
    Stopped(StopReason),
}

/// Tracks the best monitored loss and epochs since it last improved.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: Option<f64>,
    best_epoch: Option<usize>,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: None,
            best_epoch: None,
            epochs_without_improvement: 0,
        }
    }

    /// Records one epoch and returns whether it improved on the best loss.
    pub fn observe(&mut self, epoch: usize, loss: f64) -> bool {
        let improved = match self.best_loss {
            None => loss.is_finite(),
            Some(best) => loss < best,
        };
        if improved {
            self.best_loss = Some(loss);
            self.best_epoch = Some(epoch);
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }
        improved
    }

    pub fn should_stop(&self) -> bool {
        self.epochs_without_improvement >= self.patience
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub validation_loss: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub state: TrainingState,
    pub epochs_run: usize,
    pub best_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub history: Vec<EpochRecord>,
    pub best_weights: Option<SurrogateWeights>,
}

impl TrainingReport {
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            TrainingState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// NLL averaged over trajectories, steps and species.
    pub mean_nll: f64,
    /// Squared error of the rounded predicted means, same averaging.
    pub rounded_mse: f64,
    pub n_trajectories: usize,
}

/// One trajectory as true-state input rows and one-step-ahead targets.
#[derive(Debug, Clone)]
struct Sequence {
    inputs: Vec<DVector<f64>>,
    targets: Vec<DVector<f64>>,
}

pub struct Trainer {
    config: TrainingConfig,
    n_species: usize,
    n_vars: usize,
    n_steps: usize,
    train: Vec<Sequence>,
    test: Vec<Sequence>,
}

impl Trainer {
    /// Splits `tensor` into training and held-out sequences.
    ///
    /// Columns must be `[time, species.., parameters..]` with `n_species`
    /// species columns.
    pub fn new(config: TrainingConfig, tensor: &TrajectoryTensor, n_species: usize) -> Result<Self> {
        config.validate()?;
        let (n_samples, n_points, n_vars) = tensor.shape();
        if n_samples == 0 {
            return Err(CrnError::EmptyDataset("tensor has no trajectories".to_string()));
        }
        if n_points < 2 {
            return Err(CrnError::Validation(
                "trajectories need at least two points to train on".to_string(),
            ));
        }
        if n_species == 0 || n_vars < 1 + n_species {
            return Err(CrnError::Validation(format!(
                "{n_vars} tensor columns cannot hold time and {n_species} species"
            )));
        }

        let n_train = (n_samples as f64 * config.train_fraction).floor() as usize;
        if n_train == 0 {
            return Err(CrnError::EmptyDataset(format!(
                "train_fraction {} of {} trajectories leaves nothing to train on",
                config.train_fraction, n_samples
            )));
        }

        let sequences: Vec<Sequence> = (0..n_samples)
            .map(|s| Sequence {
                inputs: (0..n_points - 1)
                    .map(|t| DVector::from_column_slice(tensor.point(s, t)))
                    .collect(),
                targets: (1..n_points)
                    .map(|t| DVector::from_column_slice(&tensor.point(s, t)[1..=n_species]))
                    .collect(),
            })
            .collect();
        let mut train = sequences;
        let test = train.split_off(n_train);
        info!(
            "split {} trajectories into {} train / {} held out",
            n_samples,
            train.len(),
            test.len()
        );

        Ok(Self {
            config,
            n_species,
            n_vars,
            n_steps: n_points - 1,
            train,
            test,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn n_train(&self) -> usize {
        self.train.len()
    }

    pub fn n_test(&self) -> usize {
        self.test.len()
    }

    /// Number of parameter columns after the species columns.
    pub fn n_parameter_columns(&self) -> usize {
        self.n_vars - 1 - self.n_species
    }

    fn check_model(&self, model: &MdnNetwork) -> Result<()> {
        let arch = model.architecture();
        let expected = (self.n_species, self.n_vars);
        let got = (arch.n_species, arch.input_size);
        if expected != got {
            return Err(CrnError::ShapeMismatch {
                tensor: "model (n_species, input_size)".to_string(),
                expected,
                got,
            });
        }
        Ok(())
    }

    fn elements_per_sequence(&self) -> f64 {
        (self.n_steps * self.n_species) as f64
    }

    fn mean_nll(&self, model: &MdnNetwork, sequences: &[Sequence]) -> f64 {
        let total: f64 = sequences
            .iter()
            .map(|seq| model.sequence_nll(&seq.inputs, &seq.targets))
            .sum();
        total / (sequences.len() as f64 * self.elements_per_sequence())
    }

    /// Trains `model` in place and reports how the run ended.
    ///
    /// Cancellation is polled once before every epoch. With `restore_best`
    /// set, the best checkpoint is loaded back into `model` at the end.
    pub fn train<M>(&self, model: &mut MdnNetwork, monitor: &mut M) -> Result<TrainingReport>
    where
        M: RunMonitor + ?Sized,
    {
        self.check_model(model)?;
        let mut rng = if self.config.seed == 0 {
            ChaCha8Rng::from_entropy()
        } else {
            ChaCha8Rng::seed_from_u64(self.config.seed)
        };
        let mut optimizer = Adam::new(self.config.learning_rate);
        let mut order: Vec<usize> = (0..self.train.len()).collect();

        self.drive(model, monitor, |model, _epoch| {
            order.shuffle(&mut rng);
            let mut total = 0.0;
            for batch in order.chunks(self.config.batch_size) {
                let scale = 1.0 / (batch.len() as f64 * self.elements_per_sequence());
                let mut grads = model.zeros_like();
                for &idx in batch {
                    let seq = &self.train[idx];
                    total += model.accumulate_gradients(&seq.inputs, &seq.targets, scale, &mut grads);
                }
                model.apply_gradients(&mut optimizer, &grads);
            }
            let train_loss = total / (self.train.len() as f64 * self.elements_per_sequence());
            let validation_loss = if self.test.is_empty() {
                None
            } else {
                Some(self.mean_nll(model, &self.test))
            };
            Ok((train_loss, validation_loss))
        })
    }

    /// Epoch loop and stop logic around `run_epoch`, which updates the model
    /// and returns `(train_loss, validation_loss)`.
    fn drive<M, F>(&self, model: &mut MdnNetwork, monitor: &mut M, mut run_epoch: F) -> Result<TrainingReport>
    where
        M: RunMonitor + ?Sized,
        F: FnMut(&mut MdnNetwork, usize) -> Result<(f64, Option<f64>)>,
    {
        let n_epochs = self.config.n_epochs;
        let mut stopping = EarlyStopping::new(self.config.patience);
        let mut state = TrainingState::Idle;
        let mut history = Vec::with_capacity(n_epochs);
        let mut best_weights: Option<SurrogateWeights> = None;

        monitor.set_progress(0.0);
        for epoch in 0..n_epochs {
            if monitor.is_canceled() {
                warn!("training canceled before epoch {epoch}");
                state = TrainingState::Stopped(StopReason::Cancelled);
                break;
            }
            state = TrainingState::Training { epoch };

            let (train_loss, validation_loss) = run_epoch(model, epoch)?;
            let monitored = validation_loss.unwrap_or(train_loss);
            let improved = stopping.observe(epoch, monitored);
            if improved {
                let weights = model.weights();
                if let Some(path) = &self.config.checkpoint_path {
                    weights.save_json(path)?;
                }
                best_weights = Some(weights);
            }

            match validation_loss {
                Some(val) => info!(
                    "epoch {}/{}: train_nll={:.6} val_nll={:.6}{}",
                    epoch + 1,
                    n_epochs,
                    train_loss,
                    val,
                    if improved { " *" } else { "" }
                ),
                None => info!(
                    "epoch {}/{}: train_nll={:.6}{}",
                    epoch + 1,
                    n_epochs,
                    train_loss,
                    if improved { " *" } else { "" }
                ),
            }
            history.push(EpochRecord {
                epoch,
                train_loss,
                validation_loss,
            });
            monitor.set_progress((epoch + 1) as f64 / n_epochs as f64);

            if self.config.target_loss.is_some_and(|target| monitored <= target) {
                info!("target loss reached at epoch {}", epoch + 1);
                state = TrainingState::Stopped(StopReason::Converged);
                break;
            }
            if stopping.should_stop() {
                info!(
                    "early stop after epoch {}: no improvement for {} epochs",
                    epoch + 1,
                    self.config.patience
                );
                state = TrainingState::Stopped(StopReason::EarlyStop);
                break;
            }
        }
        if let TrainingState::Training { .. } = state {
            state = TrainingState::Stopped(StopReason::Completed);
        }

        if self.config.restore_best {
            if let Some(weights) = &best_weights {
                model.load_weights(weights)?;
            }
        }

        Ok(TrainingReport {
            state,
            epochs_run: history.len(),
            best_loss: stopping.best_loss(),
            best_epoch: stopping.best_epoch(),
            history,
            best_weights,
        })
    }

    /// Held-out pass without gradients.
    pub fn validate(&self, model: &MdnNetwork) -> Result<ValidationReport> {
        self.check_model(model)?;
        if self.test.is_empty() {
            return Err(CrnError::EmptyDataset("no held-out trajectories".to_string()));
        }

        let mut squared_error = 0.0;
        for seq in &self.test {
            for (prediction, target) in model.forward(&seq.inputs).iter().zip(&seq.targets) {
                squared_error += prediction
                    .mu
                    .iter()
                    .zip(target.iter())
                    .map(|(mu, y)| (mu.round() - y).powi(2))
                    .sum::<f64>();
            }
        }
        let elements = self.test.len() as f64 * self.elements_per_sequence();

        Ok(ValidationReport {
            mean_nll: self.mean_nll(model, &self.test),
            rounded_mse: squared_error / elements,
            n_trajectories: self.test.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::{Device, SurrogateConfig};
    use crate::monitor::{Hooks, Unmonitored};
    use crate::surrogate::Architecture;

    /// Linear decay `A = 10 - t`, `B = t`, over `n` samples.
    fn tensor(n: usize) -> TrajectoryTensor {
        let mut tensor = TrajectoryTensor::new(vec!["time".into(), "A".into(), "B".into()], 6);
        for s in 0..n {
            let offset = s as f64 * 0.1;
            let rows: Vec<f64> = (0..6)
                .flat_map(|t| {
                    let t = t as f64;
                    [t, 10.0 - t + offset, t]
                })
                .collect();
            tensor.push_flat(&rows).unwrap();
        }
        tensor
    }

    fn network() -> MdnNetwork {
        let config = SurrogateConfig {
            hidden_size: 6,
            num_layers: 1,
            device: Device::Cpu,
            init_seed: 5,
        };
        MdnNetwork::new(Architecture::for_dataset(2, 0, &config), &config).unwrap()
    }

    fn config(n_epochs: usize, patience: usize) -> TrainingConfig {
        TrainingConfig {
            n_epochs,
            patience,
            batch_size: 4,
            train_fraction: 0.8,
            learning_rate: 1e-2,
            seed: 3,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn split_is_by_leading_index() {
        let trainer = Trainer::new(config(1, 1), &tensor(10), 2).unwrap();
        assert_eq!((trainer.n_train(), trainer.n_test()), (8, 2));
        assert!((trainer.test[0].inputs[0][1] - 10.8).abs() < 1e-12);
        assert_eq!(trainer.train[0].targets.len(), 5);
        assert_eq!(trainer.train[0].targets[0].as_slice(), &[9.0, 1.0]);
    }

    #[test]
    fn empty_training_partition_is_rejected() {
        let cfg = TrainingConfig {
            train_fraction: 0.3,
            ..config(1, 1)
        };
        assert!(matches!(
            Trainer::new(cfg, &tensor(2), 2),
            Err(CrnError::EmptyDataset(_))
        ));
    }

    #[test]
    fn plateau_after_two_improving_epochs_stops_at_epoch_four() {
        let trainer = Trainer::new(config(5, 2), &tensor(10), 2).unwrap();
        let mut model = network();
        let losses = [3.0, 2.0, 2.0, 2.0, 2.0];
        let report = trainer
            .drive(&mut model, &mut Unmonitored, |_, epoch| Ok((1.0, Some(losses[epoch]))))
            .unwrap();

        assert_eq!(report.epochs_run, 4);
        assert_eq!(report.stop_reason(), Some(StopReason::EarlyStop));
        assert_eq!(report.best_epoch, Some(1));
        assert_eq!(report.best_loss, Some(2.0));
    }

    #[test]
    fn steady_improvement_runs_every_epoch() {
        let trainer = Trainer::new(config(4, 1), &tensor(10), 2).unwrap();
        let mut model = network();
        let report = trainer
            .drive(&mut model, &mut Unmonitored, |_, epoch| Ok((1.0, Some(10.0 - epoch as f64))))
            .unwrap();
        assert_eq!(report.epochs_run, 4);
        assert_eq!(report.state, TrainingState::Stopped(StopReason::Completed));
    }

    #[test]
    fn reaching_target_loss_converges() {
        let cfg = TrainingConfig {
            target_loss: Some(0.5),
            ..config(10, 3)
        };
        let trainer = Trainer::new(cfg, &tensor(10), 2).unwrap();
        let mut model = network();
        let report = trainer
            .drive(&mut model, &mut Unmonitored, |_, epoch| Ok((1.0, Some(1.0 / (epoch + 1) as f64))))
            .unwrap();
        assert_eq!(report.stop_reason(), Some(StopReason::Converged));
        assert_eq!(report.epochs_run, 2);
    }

    #[test]
    fn cancel_is_polled_per_epoch() {
        let trainer = Trainer::new(config(10, 10), &tensor(10), 2).unwrap();
        let mut model = network();
        let polls = Cell::new(0);
        let mut monitor = Hooks::new(
            |_| {},
            || {
                polls.set(polls.get() + 1);
                polls.get() > 3
            },
        );
        let report = trainer.train(&mut model, &mut monitor).unwrap();
        assert_eq!(report.stop_reason(), Some(StopReason::Cancelled));
        assert_eq!(report.epochs_run, 3);
    }

    #[test]
    fn training_lowers_held_out_loss_and_restores_best() {
        let trainer = Trainer::new(config(30, 30), &tensor(10), 2).unwrap();
        let mut model = network();
        let before = trainer.validate(&model).unwrap();

        let report = trainer.train(&mut model, &mut Unmonitored).unwrap();
        let after = trainer.validate(&model).unwrap();

        assert_eq!(after.n_trajectories, 2);
        assert!(after.mean_nll < before.mean_nll);
        assert_eq!(report.best_loss, Some(after.mean_nll));
        assert_eq!(report.best_weights, Some(model.weights()));
    }

    #[test]
    fn wrong_model_width_is_a_shape_error() {
        let trainer = Trainer::new(config(1, 1), &tensor(10), 2).unwrap();
        let config = SurrogateConfig {
            hidden_size: 4,
            num_layers: 1,
            device: Device::Cpu,
            init_seed: 1,
        };
        let mut model = MdnNetwork::new(Architecture::for_dataset(2, 1, &config), &config).unwrap();
        assert!(matches!(
            trainer.train(&mut model, &mut Unmonitored),
            Err(CrnError::ShapeMismatch { .. })
        ));
    }
}
