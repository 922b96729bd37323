use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::Writer;
use serde::{Deserialize, Serialize};

use crate::dataset::{ConditionSummary, TrajectoryTensor};
use crate::surrogate::{MdnNetwork, NamedTensor};
use crate::train::EpochRecord;
use crate::Result;

pub const GRAPH_FORMAT: &str = "crn-surrogate-graph";
pub const GRAPH_FORMAT_VERSION: u32 = 1;

/// Creates `<root>/<UTC timestamp>`, suffixing a counter on collision.
pub fn create_timestamped_output_dir(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root)?;

    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let mut output_dir = root.join(&timestamp);
    let mut counter = 1_u32;

    while output_dir.exists() {
        output_dir = root.join(format!("{timestamp}-{counter:02}"));
        counter += 1;
    }

    fs::create_dir_all(&output_dir)?;
    Ok(output_dir)
}

pub fn fmt_f64(value: f64) -> String {
    format!("{value:.10}")
}

fn fmt_option_f64(value: Option<f64>) -> String {
    value.map(fmt_f64).unwrap_or_default()
}

/// One row per (sample, time point): `sample, time, species..`.
pub fn write_trajectory_csv(path: &Path, tensor: &TrajectoryTensor) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    let mut header = vec!["sample".to_string()];
    header.extend(tensor.variable_names().iter().cloned());
    writer.write_record(&header)?;

    for sample in 0..tensor.n_samples() {
        for point in 0..tensor.n_points() {
            let mut record = vec![sample.to_string()];
            record.extend(tensor.point(sample, point).iter().map(|v| fmt_f64(*v)));
            writer.write_record(&record)?;
        }
    }

    writer.flush()?;
    Ok(())
}

/// One row per (condition, time point) with a mean and std column per variable.
pub fn write_condition_summary_csv(path: &Path, summary: &ConditionSummary) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    let mut header = vec!["condition".to_string(), "point".to_string()];
    for name in &summary.variable_names {
        header.push(format!("{name}_mean"));
        header.push(format!("{name}_std"));
    }
    writer.write_record(&header)?;

    for cond in 0..summary.n_conditions {
        for point in 0..summary.n_points {
            let mut record = vec![cond.to_string(), point.to_string()];
            for var in 0..summary.variable_names.len() {
                let idx = summary.index(cond, point, var);
                record.push(fmt_f64(summary.mean[idx]));
                record.push(fmt_f64(summary.std[idx]));
            }
            writer.write_record(&record)?;
        }
    }

    writer.flush()?;
    Ok(())
}

pub fn write_training_history_csv(path: &Path, history: &[EpochRecord]) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(["epoch", "train_loss", "validation_loss"])?;

    for record in history {
        writer.write_record([
            record.epoch.to_string(),
            fmt_f64(record.train_loss),
            fmt_option_f64(record.validation_loss),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub op: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weights: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceOutput {
    pub mu: Vec<f64>,
    pub sigma: Vec<f64>,
}

/// Portable description of the surrogate's inference path.
///
/// Nodes run in order over named values; `weights` refer to `initializers`.
/// The LSTM starts from a zero state and its gates are stacked `i, f, g, o`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationGraph {
    pub format: String,
    pub version: u32,
    pub input: String,
    /// `[batch, sequence, features]`
    pub input_shape: [usize; 3],
    pub outputs: Vec<String>,
    pub nodes: Vec<GraphNode>,
    pub initializers: Vec<NamedTensor>,
    pub reference_input: Vec<f64>,
    pub reference_output: ReferenceOutput,
}

fn node(op: &str, name: &str, input: &str, outputs: &[&str], weights: &[String]) -> GraphNode {
    GraphNode {
        op: op.to_string(),
        name: name.to_string(),
        inputs: vec![input.to_string()],
        outputs: outputs.iter().map(|o| o.to_string()).collect(),
        weights: weights.to_vec(),
        attributes: serde_json::Value::Null,
    }
}

pub fn build_graph(model: &MdnNetwork) -> Result<ComputationGraph> {
    let arch = model.architecture();
    let mut nodes = Vec::new();
    let mut current = "input".to_string();

    for layer in 0..arch.num_layers {
        let output = format!("lstm_l{layer}_out");
        let mut lstm = node(
            "lstm",
            &format!("lstm_l{layer}"),
            &current,
            &[output.as_str()],
            &[
                format!("lstm.weight_ih_l{layer}"),
                format!("lstm.weight_hh_l{layer}"),
                format!("lstm.bias_l{layer}"),
            ],
        );
        lstm.attributes = serde_json::json!({ "hidden_size": arch.hidden_size, "gate_order": "ifgo" });
        nodes.push(lstm);
        current = output;
    }

    let linear = |name: &str| vec![format!("{name}.weight"), format!("{name}.bias")];
    nodes.push(node("linear", "fc1", &current, &["fc1_out"], &linear("fc1")));
    nodes.push(node("relu", "relu1", "fc1_out", &["relu1_out"], &[]));
    nodes.push(node("linear", "fc2", "relu1_out", &["fc2_out"], &linear("fc2")));
    nodes.push(node("relu", "relu2", "fc2_out", &["relu2_out"], &[]));
    nodes.push(node("linear", "fc_out", "relu2_out", &["head_out"], &linear("fc_out")));
    let mut split = node("split", "split", "head_out", &["mu", "log_sigma"], &[]);
    split.attributes = serde_json::json!({ "sizes": [arch.n_species, arch.n_species] });
    nodes.push(split);
    nodes.push(node("exp", "exp", "log_sigma", &["sigma"], &[]));

    let reference_input = vec![0.0; arch.input_size];
    let prediction = model.predict_step(&reference_input)?;

    Ok(ComputationGraph {
        format: GRAPH_FORMAT.to_string(),
        version: GRAPH_FORMAT_VERSION,
        input: "input".to_string(),
        input_shape: [1, 1, arch.input_size],
        outputs: vec!["mu".to_string(), "sigma".to_string()],
        nodes,
        initializers: model.weights().tensors,
        reference_input,
        reference_output: ReferenceOutput {
            mu: prediction.mu.iter().copied().collect(),
            sigma: prediction.sigma.iter().copied().collect(),
        },
    })
}

pub fn export_graph(model: &MdnNetwork, path: &Path) -> Result<()> {
    write_json(path, &build_graph(model)?)
}
