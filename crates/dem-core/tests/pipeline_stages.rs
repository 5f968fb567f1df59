use dem_core::config::{PipelineConfig, RunContext};
use dem_core::domain::{Cube, Frame, LineCatalog, Observation, RatioDefinition};
use dem_core::emissivity::{EmissivityTable, TabulatedEmissivity};
use dem_core::numerics::{
    InversionError, InversionOperator, InversionProblem, InversionSolution, RegularizedInversion,
};
use dem_core::pipeline::{
    ColumnCheckpointStore, build_worker_pool, load_combined, run_composition_stage, run_dem_stage,
};
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

const LINES: [&str; 5] = [
    "fe_12_195.12",
    "fe_13_202.04",
    "si_10_258.37",
    "s_10_264.23",
    "fe_16_262.98",
];

/// Flat DEM scaled by the first intensity; counts its calls.
#[derive(Default)]
struct CountingOperator {
    calls: AtomicUsize,
}

impl InversionOperator for CountingOperator {
    fn invert(&self, problem: &InversionProblem<'_>) -> Result<InversionSolution, InversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bins = problem.target_temperatures.len() - 1;
        Ok(InversionSolution {
            dem: vec![problem.intensities[0] * 1.0e9; bins],
            dem_error: vec![0.0; bins],
            log_temperature_error: vec![0.0; bins],
            chi_square: 0.0,
            reconstructed_intensities: problem.intensities.to_vec(),
        })
    }
}

fn native_log_temperatures() -> Vec<f64> {
    (0..101).map(|i| 4.0 + 0.04 * i as f64).collect()
}

fn gaussian(peak: f64, scale: f64) -> Vec<f64> {
    native_log_temperatures()
        .iter()
        .map(|log_t| scale * (-((log_t - peak) / 0.12).powi(2)).exp())
        .collect()
}

fn emissivity() -> TabulatedEmissivity {
    let tables = [8.5, 9.5]
        .into_iter()
        .map(|log_density| {
            let mut lines = BTreeMap::new();
            lines.insert("fe_12_195.12".to_string(), gaussian(6.2, 1.0e-24));
            lines.insert("fe_13_202.04".to_string(), gaussian(6.25, 8.0e-25));
            lines.insert("si_10_258.37".to_string(), gaussian(6.15, 3.0e-25));
            lines.insert("s_10_264.23".to_string(), gaussian(6.2, 2.0e-25));
            lines.insert("fe_16_262.98".to_string(), gaussian(6.45, 5.0e-25));
            EmissivityTable {
                log_density,
                log_temperatures: native_log_temperatures(),
                lines,
            }
        })
        .collect();
    TabulatedEmissivity::new(tables).expect("emissivity tables")
}

fn observation(rows: usize, columns: usize) -> Observation {
    let mut intensity = Vec::new();
    let mut error = Vec::new();
    for row in 0..rows {
        for column in 0..columns {
            let base = 100.0 + 10.0 * row as f64 + 3.0 * column as f64;
            intensity.extend([base, 0.8 * base, 0.3 * base, 0.2 * base, 0.5 * base]);
            error.extend([0.05 * base, 0.05 * base, 0.1 * base, 0.1 * base, 0.1 * base]);
        }
    }
    // one dark pixel where no iron line clears the signal floor
    for value in intensity.iter_mut().take(LINES.len()) {
        *value = 1.0;
    }

    Observation::new(
        LineCatalog::new(LINES),
        Cube::from_values([rows, columns, LINES.len()], intensity).expect("intensity"),
        Cube::from_values([rows, columns, LINES.len()], error).expect("error"),
        Frame::filled(rows, columns, 9.0),
    )
    .expect("observation")
}

fn context(output: &std::path::Path, retain_checkpoints: bool) -> RunContext {
    let config = PipelineConfig {
        retain_checkpoints,
        ..PipelineConfig::default()
    };
    RunContext::new(output, "synthetic", config).expect("default config")
}

#[test]
fn resumed_run_is_identical_and_inverts_nothing() {
    let temp = TempDir::new().expect("tempdir should be created");
    let context = context(temp.path(), true);
    let observation = observation(3, 4);
    let emissivity = emissivity();
    let pool = build_worker_pool(3).expect("pool");

    let first_operator = CountingOperator::default();
    let (first, first_report) =
        run_dem_stage(&pool, &observation, &emissivity, &first_operator, &context).expect("first run");
    assert_eq!(first_report.computed, 4);
    assert_eq!(first_operator.calls.load(Ordering::SeqCst), 11);
    let first_bytes = fs::read(context.combined_path()).expect("combined artifact");

    let second_operator = CountingOperator::default();
    let (second, second_report) =
        run_dem_stage(&pool, &observation, &emissivity, &second_operator, &context)
            .expect("second run");

    assert_eq!(second_operator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_report.resumed, 4);
    assert_eq!(second, first);
    assert_eq!(fs::read(context.combined_path()).expect("combined artifact"), first_bytes);
}

#[test]
fn interrupted_run_only_fills_the_missing_columns() {
    let temp = TempDir::new().expect("tempdir should be created");
    let context = context(temp.path(), false);
    let observation = observation(2, 3);
    let emissivity = emissivity();
    let pool = build_worker_pool(2).expect("pool");

    let reference_dir = TempDir::new().expect("tempdir should be created");
    let reference_context = self::context(reference_dir.path(), true);
    let (reference, _) = run_dem_stage(
        &pool,
        &observation,
        &emissivity,
        &CountingOperator::default(),
        &reference_context,
    )
    .expect("reference run");

    // keep only column 1 from the reference, as if the run died midway
    let reference_store =
        ColumnCheckpointStore::new(reference_context.checkpoint_dir()).expect("store");
    let store = ColumnCheckpointStore::new(context.checkpoint_dir()).expect("store");
    store
        .save(&reference_store.load(1).expect("column 1"))
        .expect("seed checkpoint");

    let operator = CountingOperator::default();
    let (combined, report) =
        run_dem_stage(&pool, &observation, &emissivity, &operator, &context).expect("resumed run");

    assert_eq!(report.resumed, 1);
    assert_eq!(report.computed, 2);
    assert_eq!(operator.calls.load(Ordering::SeqCst), 3);
    assert_eq!(combined, reference);
    assert!(!context.checkpoint_dir().exists());
    assert_eq!(load_combined(context.combined_path()).expect("reload"), combined);
}

#[test]
fn every_dem_is_native_length_and_zero_outside_the_working_slice() {
    let temp = TempDir::new().expect("tempdir should be created");
    let context = context(temp.path(), false);
    let observation = observation(2, 2);
    let emissivity = emissivity();
    let pool = build_worker_pool(2).expect("pool");

    let (combined, _) =
        run_dem_stage(&pool, &observation, &emissivity, &RegularizedInversion, &context)
            .expect("run");

    let embedding = context.grids.embedding.clone();
    assert_eq!(embedding, 33..84);
    assert_eq!(combined.dem.depth(), 101);
    for row in 0..2 {
        for column in 0..2 {
            let dem = combined.dem.pixel(row, column);
            for (index, value) in dem.iter().enumerate() {
                if !embedding.contains(&index) {
                    assert_eq!(*value, 0.0, "bin {index} of pixel ({row}, {column})");
                }
            }
        }
    }

    assert!(combined.chi_square.get(0, 0).is_infinite());
    assert!(combined.dem.pixel(0, 0).iter().all(|value| *value == 0.0));
    assert_eq!(combined.lines_used.get(0, 0), 0.0);
    assert_eq!(combined.lines_used.get(1, 1), 3.0);
}

#[test]
fn a_broken_ratio_leaves_the_others_persisted() {
    let temp = TempDir::new().expect("tempdir should be created");
    let context = context(temp.path(), false);
    let observation = observation(2, 2);
    let emissivity = emissivity();
    let pool = build_worker_pool(2).expect("pool");
    let (combined, _) = run_dem_stage(
        &pool,
        &observation,
        &emissivity,
        &CountingOperator::default(),
        &context,
    )
    .expect("dem stage");

    let ratios = vec![
        RatioDefinition::new("sis", "si_10_258.37", "s_10_264.23", "SiX_SX"),
        RatioDefinition::new("CaAr", "ca_14_193.87", "ar_14_194.40", "CaXIV_ArXIV"),
        RatioDefinition::new("FeS", "fe_16_262.98", "s_10_264.23", "FeXVI_SX"),
    ];
    let report = run_composition_stage(&pool, &observation, &combined, &emissivity, &ratios, &context)
        .expect("composition stage");

    let failed: Vec<&str> = report.failed().map(|outcome| outcome.label()).collect();
    assert_eq!(failed, vec!["CaAr"]);
    for label in ["sis", "FeS"] {
        assert!(context.composition_path(label).is_file(), "{label} artifact");
        assert!(context.composition_map_path(label).is_file(), "{label} map");
    }
    assert!(!context.composition_path("CaAr").exists());
}
