//! Persisted surrogate: weights plus everything needed to interpret them.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::{Device, SimulationConfig, SurrogateConfig};
use crate::model::{GillespieModel, ReactionSolver};
use crate::surrogate::{Architecture, MdnNetwork, SurrogateWeights};
use crate::{CrnError, Result};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// Species and parameter order, definition text and simulation window that
/// a trained surrogate depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpecMetadata {
    pub species: Vec<String>,
    pub parameters: Vec<String>,
    /// Whether parameter values are appended as constant input columns.
    pub includes_parameters: bool,
    pub definition_text: String,
    pub simulation: SimulationConfig,
}

impl ModelSpecMetadata {
    pub fn from_model(
        model: &GillespieModel,
        simulation: &SimulationConfig,
        includes_parameters: bool,
    ) -> Self {
        Self {
            species: model.species_names().to_vec(),
            parameters: model.parameter_names().to_vec(),
            includes_parameters,
            definition_text: model.definition_text().to_string(),
            simulation: simulation.clone(),
        }
    }

    pub fn n_parameter_columns(&self) -> usize {
        if self.includes_parameters {
            self.parameters.len()
        } else {
            0
        }
    }

    /// Re-parses the stored definition and checks its name order.
    pub fn reconstruct_model(&self) -> Result<GillespieModel> {
        let model = GillespieModel::load(&self.definition_text)?;
        if model.species_names() != self.species.as_slice() {
            return Err(CrnError::Validation(format!(
                "definition species {:?} do not match metadata {:?}",
                model.species_names(),
                self.species
            )));
        }
        if model.parameter_names() != self.parameters.as_slice() {
            return Err(CrnError::Validation(format!(
                "definition parameters {:?} do not match metadata {:?}",
                model.parameter_names(),
                self.parameters
            )));
        }
        Ok(model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub metadata: ModelSpecMetadata,
    pub architecture: Architecture,
    #[serde(default)]
    pub device: Device,
    pub weights: SurrogateWeights,
}

impl ModelArtifact {
    pub fn new(metadata: ModelSpecMetadata, network: &MdnNetwork) -> Result<Self> {
        let architecture = network.architecture();
        check_architecture(&metadata, &architecture)?;
        Ok(Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            metadata,
            architecture,
            device: network.device(),
            weights: network.weights(),
        })
    }

    /// Writes to a sibling temporary file, then renames it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_string(self)?;
        let tmp = temporary_sibling(path);
        fs::write(&tmp, payload)?;
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        info!("saved model artifact to {}", path.display());
        Ok(())
    }

    /// Reads an artifact and checks it against its own definition text.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)?;
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(CrnError::Validation(format!(
                "unsupported artifact format version {}",
                artifact.format_version
            )));
        }
        artifact.metadata.reconstruct_model()?;
        check_architecture(&artifact.metadata, &artifact.architecture)?;
        Ok(artifact)
    }

    /// Rebuilds the trained network.
    pub fn instantiate(&self) -> Result<MdnNetwork> {
        self.metadata.reconstruct_model()?;
        check_architecture(&self.metadata, &self.architecture)?;

        let config = SurrogateConfig {
            hidden_size: self.architecture.hidden_size,
            num_layers: self.architecture.num_layers,
            device: self.device,
            init_seed: 1,
        };
        let mut network = MdnNetwork::new(self.architecture, &config)?;
        network.load_weights(&self.weights)?;
        Ok(network)
    }
}

fn check_architecture(metadata: &ModelSpecMetadata, architecture: &Architecture) -> Result<()> {
    let expected = (
        metadata.species.len(),
        1 + metadata.species.len() + metadata.n_parameter_columns(),
    );
    let got = (architecture.n_species, architecture.input_size);
    if expected != got {
        return Err(CrnError::ShapeMismatch {
            tensor: "architecture (n_species, input_size)".to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "artifact".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const DEFINITION: &str = "A -> B; k*A\nA = 10\nB = 0\nk = 0.5\n";

    fn trained() -> (ModelSpecMetadata, MdnNetwork) {
        let model = GillespieModel::load(DEFINITION).unwrap();
        let metadata = ModelSpecMetadata::from_model(&model, &SimulationConfig::default(), false);
        let config = SurrogateConfig {
            hidden_size: 3,
            num_layers: 1,
            device: Device::Cpu,
            init_seed: 11,
        };
        let network = MdnNetwork::new(Architecture::for_dataset(2, 0, &config), &config).unwrap();
        (metadata, network)
    }

    #[test]
    fn save_load_instantiate_restores_network() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        let (metadata, network) = trained();

        ModelArtifact::new(metadata, &network).unwrap().save(&path).unwrap();
        assert!(!dir.path().join("model.json.tmp").exists());

        let loaded = ModelArtifact::load(&path).unwrap();
        assert_eq!(loaded.metadata.species, vec!["A", "B"]);
        assert_eq!(loaded.instantiate().unwrap(), network);
    }

    #[test]
    fn reordered_definition_is_rejected() {
        let (mut metadata, network) = trained();
        let artifact = ModelArtifact::new(metadata.clone(), &network).unwrap();
        metadata.definition_text = "species B, A\nA -> B; k*A\nA = 10\nk = 0.5\n".to_string();
        let tampered = ModelArtifact { metadata, ..artifact };
        assert!(matches!(tampered.instantiate(), Err(CrnError::Validation(_))));
    }

    #[test]
    fn species_count_mismatch_is_a_shape_error() {
        let (mut metadata, network) = trained();
        metadata.definition_text = "A -> B; k*A\nB -> C; k*B\nA = 10\nk = 0.5\n".to_string();
        metadata.species = vec!["A".into(), "B".into(), "C".into()];
        assert!(matches!(
            ModelArtifact::new(metadata, &network),
            Err(CrnError::ShapeMismatch { .. })
        ));
    }
}
