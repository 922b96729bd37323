use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, LevelFilter};

use crn_surrogate::dataset::simulate_replicates;
use crn_surrogate::network::{read_definition, write_definition};
use crn_surrogate::output::{
    create_timestamped_output_dir, export_graph, write_condition_summary_csv, write_trajectory_csv,
    write_training_history_csv,
};
use crn_surrogate::{
    Architecture, AutoregressiveSampler, DatasetBundle, DatasetGenerator, GenerationStatus,
    GillespieModel, Hooks, InitialConditionSet, MdnNetwork, ModelArtifact, ModelSpecMetadata,
    ParameterPerturbationSet, PipelineConfig, Randomizer, ReactionSolver, RoundingPolicy, Trainer,
};

#[derive(Debug, Parser)]
#[command(name = "crn-surrogate")]
#[command(about = "Gillespie datasets and mixture-density LSTM surrogates for reaction networks")]
struct Cli {
    /// Pipeline configuration (TOML); flags below override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "output-crn-surrogate")]
    outdir: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run replicate SSA trajectories of a definition's nominal state
    Simulate {
        #[arg(long)]
        model: PathBuf,
        #[arg(long, default_value_t = 10)]
        replicates: usize,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Randomize initial conditions and build a training dataset
    Generate {
        #[arg(long)]
        model: PathBuf,
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long)]
        n_init_conditions: Option<usize>,
        #[arg(long)]
        n_sims: Option<usize>,
        #[arg(long)]
        perturb_parameters: bool,
    },
    /// Train a surrogate on a generated dataset
    Train {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        patience: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        hidden_size: Option<usize>,
        #[arg(long)]
        num_layers: Option<usize>,
    },
    /// Roll out a trained surrogate autoregressively
    Sample {
        #[arg(long)]
        artifact: PathBuf,
        /// Take initial conditions from this dataset instead of the nominal state
        #[arg(long)]
        dataset: Option<PathBuf>,
        #[arg(long)]
        steps: Option<usize>,
        #[arg(long)]
        n_sims: Option<usize>,
        #[arg(long, value_enum)]
        rounding: Option<RoundingArg>,
    },
    /// Write a trained surrogate as a portable computation graph
    Export {
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Convert a definition between rule text (.txt/.ant) and JSON (.json)
    Convert { input: PathBuf, output: PathBuf },
}

#[derive(Debug, Args)]
struct WindowArgs {
    #[arg(long)]
    start_time: Option<f64>,
    #[arg(long)]
    end_time: Option<f64>,
    #[arg(long)]
    n_steps: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoundingArg {
    Nearest,
    NearestNonNegative,
    Continuous,
}

impl From<RoundingArg> for RoundingPolicy {
    fn from(arg: RoundingArg) -> Self {
        match arg {
            RoundingArg::Nearest => RoundingPolicy::Nearest,
            RoundingArg::NearestNonNegative => RoundingPolicy::NearestNonNegative,
            RoundingArg::Continuous => RoundingPolicy::Continuous,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(error) = run(cli) {
        eprintln!("crn-surrogate failed: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }
    builder.init();
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn apply_window(cfg: &mut PipelineConfig, window: &WindowArgs) {
    let sim = &mut cfg.simulation;
    if let Some(v) = window.start_time {
        sim.start_time = v;
    }
    if let Some(v) = window.end_time {
        sim.end_time = v;
    }
    if let Some(v) = window.n_steps {
        sim.n_steps = v;
    }
    if let Some(v) = window.seed {
        sim.random_seed = v;
        cfg.randomization.seed = v;
        cfg.training.seed = v;
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Simulate {
            model,
            replicates,
            window,
        } => {
            apply_window(&mut cfg, &window);
            cfg.validate()?;
            run_simulate(&cfg, &model, replicates, &cli.outdir)
        }
        Command::Generate {
            model,
            window,
            n_init_conditions,
            n_sims,
            perturb_parameters,
        } => {
            apply_window(&mut cfg, &window);
            if let Some(v) = n_init_conditions {
                cfg.simulation.n_init_conditions = v;
            }
            if let Some(v) = n_sims {
                cfg.simulation.n_sims_per_init_condition = v;
            }
            cfg.randomization.perturb_parameters |= perturb_parameters;
            cfg.validate()?;
            run_generate(&cfg, &model, &cli.outdir)
        }
        Command::Train {
            dataset,
            epochs,
            patience,
            batch_size,
            hidden_size,
            num_layers,
        } => {
            if let Some(v) = epochs {
                cfg.training.n_epochs = v;
            }
            if let Some(v) = patience {
                cfg.training.patience = v;
            }
            if let Some(v) = batch_size {
                cfg.training.batch_size = v;
            }
            if let Some(v) = hidden_size {
                cfg.surrogate.hidden_size = v;
            }
            if let Some(v) = num_layers {
                cfg.surrogate.num_layers = v;
            }
            cfg.validate()?;
            run_train(&cfg, &dataset, &cli.outdir)
        }
        Command::Sample {
            artifact,
            dataset,
            steps,
            n_sims,
            rounding,
        } => {
            if let Some(v) = steps {
                cfg.sampler.n_steps = v;
            }
            if let Some(v) = n_sims {
                cfg.sampler.n_sims_per_condition = v;
            }
            if let Some(v) = rounding {
                cfg.sampler.rounding = v.into();
            }
            cfg.validate()?;
            run_sample(&cfg, &artifact, dataset.as_deref(), &cli.outdir)
        }
        Command::Export { artifact, out } => {
            let artifact = ModelArtifact::load(&artifact)
                .with_context(|| format!("failed to load artifact {}", artifact.display()))?;
            let network = artifact.instantiate()?;
            export_graph(&network, &out)?;
            println!("Graph: {}", out.display());
            Ok(())
        }
        Command::Convert { input, output } => {
            let (definition, _) = read_definition(&input)
                .with_context(|| format!("failed to read definition {}", input.display()))?;
            write_definition(&definition, &output)?;
            println!("Definition: {}", output.display());
            Ok(())
        }
    }
}

fn progress_monitor(stage: &'static str) -> Hooks<impl FnMut(f64), impl Fn() -> bool> {
    let mut last_decile = -1_i64;
    Hooks::new(
        move |fraction: f64| {
            let decile = (fraction * 10.0).floor() as i64;
            if decile > last_decile {
                last_decile = decile;
                info!("{stage}: {:.0}%", fraction * 100.0);
            }
        },
        || false,
    )
}

fn run_simulate(cfg: &PipelineConfig, path: &Path, replicates: usize, outdir: &Path) -> Result<()> {
    let mut model = GillespieModel::from_file(path)
        .with_context(|| format!("failed to load model {}", path.display()))?
        .with_seed(cfg.simulation.random_seed);
    let tensor = simulate_replicates(&mut model, &cfg.simulation, replicates)?;

    let run_dir = create_timestamped_output_dir(outdir)?;
    write_trajectory_csv(&run_dir.join("trajectories.csv"), &tensor)?;
    write_condition_summary_csv(
        &run_dir.join("summary.csv"),
        &tensor.condition_summary(replicates)?,
    )?;

    println!("Trajectories: {}", tensor.n_samples());
    println!("Output directory: {}", run_dir.display());
    Ok(())
}

fn run_generate(cfg: &PipelineConfig, path: &Path, outdir: &Path) -> Result<()> {
    let mut model = GillespieModel::from_file(path)
        .with_context(|| format!("failed to load model {}", path.display()))?
        .with_seed(cfg.simulation.random_seed);

    let mut randomizer = Randomizer::from_seed(cfg.randomization.seed);
    let (conditions, parameters) = randomizer.randomize(
        &cfg.randomization,
        &model.species_values(),
        &model.parameter_values(),
        cfg.simulation.n_init_conditions,
    )?;

    let generator = DatasetGenerator::new(cfg.simulation.clone())?;
    let outcome = generator.generate(
        &mut model,
        &conditions,
        parameters.as_ref(),
        &mut progress_monitor("generate"),
    )?;
    if let GenerationStatus::Partial {
        conditions_completed,
    } = outcome.status
    {
        println!("Partial dataset: {conditions_completed} conditions");
    }

    let metadata = ModelSpecMetadata::from_model(&model, &cfg.simulation, parameters.is_some());
    let bundle = DatasetBundle::new(metadata, outcome)?;

    let run_dir = create_timestamped_output_dir(outdir)?;
    bundle.save_json(&run_dir.join("dataset.json"))?;
    write_trajectory_csv(&run_dir.join("trajectories.csv"), &bundle.tensor)?;
    write_condition_summary_csv(
        &run_dir.join("summary.csv"),
        &bundle
            .tensor
            .condition_summary(cfg.simulation.n_sims_per_init_condition)?,
    )?;

    println!("Dataset shape: {:?}", bundle.tensor.shape());
    println!("Output directory: {}", run_dir.display());
    Ok(())
}

fn run_train(cfg: &PipelineConfig, path: &Path, outdir: &Path) -> Result<()> {
    let bundle = DatasetBundle::load_json(path)
        .with_context(|| format!("failed to load dataset {}", path.display()))?;
    let metadata = &bundle.metadata;
    let n_species = metadata.species.len();

    let architecture =
        Architecture::for_dataset(n_species, metadata.n_parameter_columns(), &cfg.surrogate);
    let mut network = MdnNetwork::new(architecture, &cfg.surrogate)?;
    info!(
        "surrogate: {} inputs, hidden {}, {} layers, {} parameters",
        architecture.input_size,
        architecture.hidden_size,
        architecture.num_layers,
        network.parameter_count()
    );

    let trainer = Trainer::new(cfg.training.clone(), &bundle.tensor, n_species)?;
    let report = trainer.train(&mut network, &mut progress_monitor("train"))?;

    let run_dir = create_timestamped_output_dir(outdir)?;
    write_training_history_csv(&run_dir.join("history.csv"), &report.history)?;
    ModelArtifact::new(metadata.clone(), &network)?.save(&run_dir.join("model.json"))?;

    println!("Stopped: {:?} after {} epochs", report.state, report.epochs_run);
    if let Some(best) = report.best_loss {
        println!("Best loss: {best:.6}");
    }
    if trainer.n_test() > 0 {
        let validation = trainer.validate(&network)?;
        println!(
            "Held out: mean_nll={:.6} rounded_mse={:.6} ({} trajectories)",
            validation.mean_nll, validation.rounded_mse, validation.n_trajectories
        );
    }
    println!("Output directory: {}", run_dir.display());
    Ok(())
}

fn run_sample(cfg: &PipelineConfig, path: &Path, dataset: Option<&Path>, outdir: &Path) -> Result<()> {
    let artifact = ModelArtifact::load(path)
        .with_context(|| format!("failed to load artifact {}", path.display()))?;
    let network = artifact.instantiate()?;
    let metadata = &artifact.metadata;
    let model = metadata.reconstruct_model()?;

    let conditions = match dataset {
        Some(dataset) => {
            let bundle = DatasetBundle::load_json(dataset)
                .with_context(|| format!("failed to load dataset {}", dataset.display()))?;
            if bundle.metadata.species != metadata.species {
                bail!(
                    "dataset species {:?} do not match artifact species {:?}",
                    bundle.metadata.species,
                    metadata.species
                );
            }
            bundle.initial_conditions()?
        }
        None => InitialConditionSet::single(&model.species_values()),
    };

    let mut sampler =
        AutoregressiveSampler::new(&network, metadata.species.clone(), cfg.sampler.rounding)?;
    if metadata.includes_parameters {
        sampler = sampler.with_parameters(ParameterPerturbationSet::single(&model.parameter_values()))?;
    }
    let tensor = sampler.simulate(
        &conditions,
        metadata.simulation.step_size(),
        cfg.sampler.n_steps,
        cfg.sampler.n_sims_per_condition,
    )?;

    let run_dir = create_timestamped_output_dir(outdir)?;
    write_trajectory_csv(&run_dir.join("sampled.csv"), &tensor)?;

    println!("Sampled shape: {:?}", tensor.shape());
    println!("Output directory: {}", run_dir.display());
    Ok(())
}
