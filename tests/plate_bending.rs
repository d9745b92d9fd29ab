use approx::assert_relative_eq;
use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use plate_pinn::inference::{load_artifacts, predict_grid};
use plate_pinn::metrics::tensor_values;
use plate_pinn::pinn::PlatePinn;
use plate_pinn::plate::{LoadConfig, Plate, PlateConfig};
use plate_pinn::sensors::{Measurement, load_measurements, save_measurements};
use plate_pinn::training::{TrainingConfig, save_surrogate, train};
use plate_pinn::{CONFIG_FILENAME, PLATE_FILENAME, SENSORS_FILENAME};
use rand::SeedableRng;
use rand::rngs::StdRng;

type Backend = NdArray<f32>;
type TrainBackend = Autodiff<NdArray<f32>>;

const CENTER_DEFLECTION: f32 = 0.00045886;

fn env_usize(name: &str, default_val: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default_val)
}

fn reference_plate() -> Plate {
    let sensors = load_measurements(concat!(env!("CARGO_MANIFEST_DIR"), "/data/sensors.json")).unwrap();
    Plate::new(&PlateConfig::new(), sensors).unwrap()
}

fn temp_artifacts(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("plate_pinn_{name}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn reference_batch_has_expected_layout() {
    let plate = reference_plate();
    let mut rng = StdRng::seed_from_u64(7);

    let batch = plate.sample_batch(&mut rng, 800, 100);

    assert_eq!(batch.len(), 1205);
    assert_eq!(batch.measurement_count(), 1);
    assert_eq!(batch.measurement_range(1).unwrap(), 1204..1205);
    let last = batch.points()[1204];
    assert_eq!((last.x, last.y), (2.0, 2.0));
}

#[test]
fn untrained_model_starts_with_uniform_weights() {
    let device = Default::default();
    let plate = reference_plate();
    let config = TrainingConfig::new(AdamConfig::new());
    let model = PlatePinn::<Backend>::new(&config.surrogate(&plate), &plate, &device).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let batch = plate.sample_batch(&mut rng, 64, 8);

    let report = model.loss(&plate, &batch).unwrap().report().unwrap();

    assert!(report.is_finite());
    assert_eq!(
        report.terms.keys().cloned().collect::<Vec<_>>(),
        vec!["L_D", "L_f", "L_m", "L_w"]
    );
    for weight in report.weights.values() {
        assert_relative_eq!(*weight, 0.25, max_relative = 1e-6);
    }
    let raw = tensor_values(model.weights().raw()).unwrap();
    assert!(raw.iter().all(|w| (*w - 0.25).abs() < 1e-6));
}

#[test]
fn navier_reference_matches_tabulated_values() {
    let plate = reference_plate();
    let center = plate.reference_deflection(2.0, 2.0, None).unwrap();
    assert_relative_eq!(center, 4.475e-4, max_relative = 5e-3);
    assert_relative_eq!(center, CENTER_DEFLECTION, max_relative = 3e-2);
    assert_relative_eq!(plate.reference_deflection(0.0, 0.0, None).unwrap(), 0.0, epsilon = 1e-12);
}

#[test]
fn saved_surrogate_predicts_like_the_trained_one() {
    let dir = temp_artifacts("roundtrip");
    let device = Default::default();
    let plate = reference_plate();
    let plate_config = PlateConfig::new();
    let config = TrainingConfig::new(AdamConfig::new())
        .with_num_epochs(2)
        .with_steps_per_epoch(2)
        .with_domain_points(32)
        .with_boundary_points(4)
        .with_hidden_size(8)
        .with_num_layers(3);

    let outcome = train::<TrainBackend>(&config, &plate, &device).unwrap();
    let trained = outcome.model.into_surrogate().valid();
    let expected = predict_grid(&trained, &plate, 4, None, &device).unwrap();

    config.save(dir.join(CONFIG_FILENAME)).unwrap();
    plate_config.save(dir.join(PLATE_FILENAME)).unwrap();
    save_measurements(dir.join(SENSORS_FILENAME), plate.measurements()).unwrap();
    save_surrogate(trained, &dir).unwrap();

    let (loaded_plate, loaded) = load_artifacts::<Backend>(&dir, &device).unwrap();
    let actual = predict_grid(&loaded, &loaded_plate, 4, None, &device).unwrap();

    assert_relative_eq!(loaded_plate.flexural_rigidity(), plate.flexural_rigidity());
    for (a, e) in actual.deflection.iter().zip(&expected.deflection) {
        assert_relative_eq!(*a, *e, epsilon = 1e-7);
    }
    for (a, e) in actual.mx.iter().zip(&expected.mx) {
        assert_relative_eq!(*a, *e, epsilon = 1e-5, max_relative = 1e-4);
    }
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn variable_load_plate_trains_on_three_inputs() {
    let device = Default::default();
    let sensors =
        load_measurements(concat!(env!("CARGO_MANIFEST_DIR"), "/data/sensors_variable.json")).unwrap();
    let plate_config = PlateConfig::load(concat!(env!("CARGO_MANIFEST_DIR"), "/configs/plate_variable.json"))
        .unwrap();
    assert_eq!(plate_config.load, LoadConfig::Variable { min: 0.005, max: 0.02 });
    let plate = Plate::new(&plate_config, sensors).unwrap();
    let config = TrainingConfig::new(AdamConfig::new())
        .with_num_epochs(1)
        .with_steps_per_epoch(2)
        .with_domain_points(16)
        .with_boundary_points(2)
        .with_hidden_size(8)
        .with_num_layers(3);

    let outcome = train::<TrainBackend>(&config, &plate, &device).unwrap();

    let metrics = &outcome.history[0];
    assert!(metrics.train.terms.contains_key("L_p"));
    assert!(!metrics.train.terms.contains_key("L_f"));
    let surrogate = outcome.model.into_surrogate().valid();
    let grid = predict_grid(&surrogate, &plate, 3, Some(0.01), &device).unwrap();
    assert!(grid.deflection.iter().all(|w| w.is_finite()));
}

#[test]
fn default_optimizer_reduces_validation_loss() {
    let device = Default::default();
    let plate = reference_plate();
    let config = TrainingConfig::new(AdamConfig::new())
        .with_num_epochs(6)
        .with_steps_per_epoch(10)
        .with_domain_points(64)
        .with_boundary_points(8)
        .with_early_stopping_patience(100);

    let outcome = train::<TrainBackend>(&config, &plate, &device).unwrap();

    let first = outcome.history.first().unwrap().validation.total;
    let last = outcome.history.last().unwrap().validation.total;
    assert!(last < first, "validation loss {first:.3e} -> {last:.3e}");
    for metrics in &outcome.history {
        assert!(metrics.min_weight > 0.2, "weights collapsed: {:?}", metrics.train.weights);
    }

    let surrogate = outcome.model.into_surrogate().valid();
    let grid = predict_grid(&surrogate, &plate, 3, None, &device).unwrap();
    let scale = plate.characteristic_deflection();
    assert!(grid.deflection.iter().all(|w| w.abs() < 20.0 * scale));
}

/// 既定の4x4板を学習し、中央と角点のたわみを確認します。
///
/// 実行時間が長いため既定では無視します。`PINN_EPOCHS` でエポック数を変更できます。
#[test]
#[ignore]
fn trained_plate_recovers_center_deflection() {
    let device = Default::default();
    let plate = Plate::new(
        &PlateConfig::new(),
        vec![Measurement::new(2.0, 2.0, CENTER_DEFLECTION).with_load(0.00948)],
    )
    .unwrap();
    let config = TrainingConfig::new(AdamConfig::new()).with_num_epochs(env_usize("PINN_EPOCHS", 200));

    let outcome = train::<TrainBackend>(&config, &plate, &device).unwrap();
    let surrogate = outcome.model.into_surrogate().valid();
    let grid = predict_grid(&surrogate, &plate, 5, None, &device).unwrap();

    // 5x5格子の中央は添字12、角点は0, 4, 20, 24
    let center = grid.deflection[12];
    assert_relative_eq!(center, CENTER_DEFLECTION, max_relative = 0.2);
    for corner in [0, 4, 20, 24] {
        assert!(
            grid.deflection[corner].abs() < 0.1 * CENTER_DEFLECTION,
            "corner {corner}: {}",
            grid.deflection[corner]
        );
    }
}
