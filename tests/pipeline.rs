use tempfile::TempDir;

use crn_surrogate::output::{build_graph, write_trajectory_csv};
use crn_surrogate::{
    Architecture, AutoregressiveSampler, DatasetBundle, DatasetGenerator, Device, GenerationStatus,
    GillespieModel, MdnNetwork, ModelArtifact, ModelSpecMetadata, NetworkDefinition, Randomizer,
    RandomizationConfig, ReactionSolver, RoundingPolicy, SimulationConfig, StopReason,
    SurrogateConfig, Trainer, TrainingConfig, Unmonitored,
};

const BIRTH_DEATH: &str = "\
model birth_death()
  species A, B
  make: -> A; kb
  convert: A -> B; kc*A
  decay: B -> ; kd*B
  A = 5
  B = 0
  kb = 2
  kc = 0.5
  kd = 0.2
end
";

fn simulation() -> SimulationConfig {
    SimulationConfig {
        start_time: 0.0,
        end_time: 5.0,
        n_steps: 5,
        n_init_conditions: 4,
        n_sims_per_init_condition: 3,
        random_seed: 42,
    }
}

#[test]
fn parsing_is_deterministic() {
    let first = GillespieModel::load(BIRTH_DEATH).unwrap();
    let second = GillespieModel::load(BIRTH_DEATH).unwrap();
    assert_eq!(first.species_names(), second.species_names());
    assert_eq!(first.species_names(), &["A", "B"]);
    assert_eq!(first.parameter_names(), &["kb", "kc", "kd"]);
}

#[test]
fn zero_species_scenario_keeps_zero_and_bounds_nonzero() {
    let mut randomizer = Randomizer::from_seed(9);
    let nominal = vec![("A".to_string(), 0.0), ("B".to_string(), 20.0)];
    let conditions = randomizer
        .randomize_initial_conditions(&nominal, 3, 0.1, 0.0, (0.0, 10.0))
        .unwrap();
    assert_eq!(conditions.len(), 3);
    for row in conditions.rows() {
        assert_eq!(row[0], 0.0);
        assert!((18.0..=22.0).contains(&row[1]));
    }
}

#[test]
fn generate_train_persist_and_sample() {
    let dir = TempDir::new().unwrap();
    let sim = simulation();

    let mut model = GillespieModel::load(BIRTH_DEATH).unwrap().with_seed(sim.random_seed);
    let randomization = RandomizationConfig {
        zero_perturb_prob: 1.0,
        zero_perturb_range: (0.0, 4.0),
        seed: 7,
        ..RandomizationConfig::default()
    };
    let mut randomizer = Randomizer::from_seed(randomization.seed);
    let (conditions, parameters) = randomizer
        .randomize(
            &randomization,
            &model.species_values(),
            &model.parameter_values(),
            sim.n_init_conditions,
        )
        .unwrap();
    assert!(parameters.is_none());

    let generator = DatasetGenerator::new(sim.clone()).unwrap();
    let outcome = generator
        .generate(&mut model, &conditions, None, &mut Unmonitored)
        .unwrap();
    assert_eq!(outcome.status, GenerationStatus::Complete);
    assert_eq!(outcome.tensor.shape(), (12, 6, 3));
    // every replicate starts from its condition
    for s in 0..12 {
        assert_eq!(&outcome.tensor.point(s, 0)[1..], conditions.row(s / 3));
    }

    let metadata = ModelSpecMetadata::from_model(&model, &sim, false);
    let bundle = DatasetBundle::new(metadata, outcome).unwrap();
    let dataset_path = dir.path().join("dataset.json");
    bundle.save_json(&dataset_path).unwrap();
    let bundle = DatasetBundle::load_json(&dataset_path).unwrap();
    assert_eq!(bundle.initial_conditions().unwrap().len(), 4);
    write_trajectory_csv(&dir.path().join("trajectories.csv"), &bundle.tensor).unwrap();

    let surrogate = SurrogateConfig {
        hidden_size: 8,
        num_layers: 2,
        device: Device::Cpu,
        init_seed: 3,
    };
    let architecture = Architecture::for_dataset(2, 0, &surrogate);
    let mut network = MdnNetwork::new(architecture, &surrogate).unwrap();
    let training = TrainingConfig {
        n_epochs: 3,
        patience: 3,
        batch_size: 4,
        learning_rate: 5e-3,
        seed: 11,
        ..TrainingConfig::default()
    };
    let trainer = Trainer::new(training, &bundle.tensor, 2).unwrap();
    assert_eq!((trainer.n_train(), trainer.n_test()), (9, 3));
    let report = trainer.train(&mut network, &mut Unmonitored).unwrap();
    assert!(report.epochs_run >= 1 && report.epochs_run <= 3);
    assert!(matches!(
        report.stop_reason(),
        Some(StopReason::Completed) | Some(StopReason::EarlyStop)
    ));
    assert!(trainer.validate(&network).unwrap().mean_nll.is_finite());

    let artifact_path = dir.path().join("model.json");
    ModelArtifact::new(bundle.metadata.clone(), &network)
        .unwrap()
        .save(&artifact_path)
        .unwrap();
    let artifact = ModelArtifact::load(&artifact_path).unwrap();
    let restored = artifact.instantiate().unwrap();
    assert_eq!(restored, network);

    let sampler = AutoregressiveSampler::new(
        &restored,
        artifact.metadata.species.clone(),
        RoundingPolicy::Nearest,
    )
    .unwrap();
    let start = bundle.initial_conditions().unwrap();
    let step = artifact.metadata.simulation.step_size();
    let first = sampler.simulate(&start, step, 8, 2).unwrap();
    let second = sampler.simulate(&start, step, 8, 2).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.shape(), (8, 9, 3));
    assert_eq!(first.point(0, 8)[0], 8.0);

    let graph = build_graph(&restored).unwrap();
    assert_eq!(graph.input_shape, [1, 1, 3]);
}

#[test]
fn exchange_json_loads_like_rules() {
    let rules = NetworkDefinition::parse(BIRTH_DEATH).unwrap();
    let json = crn_surrogate::network::exchange::to_json(&rules).unwrap();
    let model = GillespieModel::load(&json).unwrap();
    assert_eq!(model.species_names(), &["A", "B"]);
    assert_eq!(model.value("kc"), Some(0.5));
}
