use super::CliError;
use anyhow::Context;
use dem_core::config::{PipelineConfig, RunContext};
use dem_core::domain::{DemError, Observation, RatioDefinition, load_observation};
use dem_core::emissivity::{EmissivityError, TabulatedEmissivity};
use dem_core::pipeline::{
    CompositionReport, DemStageReport, RatioOutcome, ThreadPool, build_worker_pool,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";
const FALLBACK_RUN_NAME: &str = "observation";

/// Installs the stderr subscriber; `RUST_LOG` overrides the default filter.
pub(super) fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub(super) fn load_config(
    path: Option<&Path>,
    workers: Option<usize>,
) -> Result<PipelineConfig, CliError> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path).map_err(CliError::Compute)?,
        None => PipelineConfig::default(),
    };
    if let Some(workers) = workers {
        if workers == 0 {
            return Err(CliError::Usage("--workers must be at least 1".to_string()));
        }
        config.worker_count = Some(workers);
    }
    Ok(config)
}

pub(super) fn load_emissivity(path: &Path) -> Result<TabulatedEmissivity, CliError> {
    TabulatedEmissivity::load(path).map_err(|error| {
        CliError::Compute(match error {
            EmissivityError::Read { .. } => {
                DemError::io_system("IO.EMISSIVITY_READ", error.to_string())
            }
            _ => DemError::input_validation("INPUT.EMISSIVITY", error.to_string()),
        })
    })
}

/// Ratio definitions from a JSON list, or the built-in set.
pub(super) fn load_ratios(path: Option<&Path>) -> Result<Vec<RatioDefinition>, CliError> {
    let Some(path) = path else {
        return Ok(RatioDefinition::default_set());
    };
    let source = fs::read_to_string(path)
        .with_context(|| format!("failed to read ratio definitions '{}'", path.display()))?;
    serde_json::from_str(&source).map_err(|source| {
        CliError::Compute(DemError::input_validation(
            "INPUT.RATIOS_PARSE",
            format!(
                "failed to parse ratio definitions '{}': {}",
                path.display(),
                source
            ),
        ))
    })
}

/// Run name derived from the observation file stem.
pub(super) fn run_name_for(observation: &Path) -> String {
    observation
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or(FALLBACK_RUN_NAME)
        .to_string()
}

/// Inputs shared by every stage of one observation.
pub(super) struct Session {
    pub(super) observation: Observation,
    pub(super) context: RunContext,
}

pub(super) fn open_session(
    observation_path: &Path,
    output_dir: PathBuf,
    config: PipelineConfig,
) -> Result<Session, CliError> {
    let observation = load_observation(observation_path).map_err(CliError::Compute)?;
    let context = RunContext::new(output_dir, run_name_for(observation_path), config)
        .map_err(CliError::Compute)?;
    Ok(Session {
        observation,
        context,
    })
}

pub(super) fn start_pool(config: &PipelineConfig) -> Result<ThreadPool, CliError> {
    build_worker_pool(config.workers()).map_err(CliError::Compute)
}

pub(super) fn print_dem_report(report: &DemStageReport) {
    println!(
        "DEM stage: computed={} resumed={} recomputed={} -> {}",
        report.computed,
        report.resumed,
        report.recomputed,
        report.combined_path.display()
    );
}

pub(super) fn print_composition_report(report: &CompositionReport) {
    for outcome in &report.outcomes {
        match outcome {
            RatioOutcome::Completed {
                label,
                artifact,
                degenerate_pixels,
                ..
            } => println!(
                "composition {}: ok degenerate_pixels={} -> {}",
                label,
                degenerate_pixels,
                artifact.display()
            ),
            RatioOutcome::Failed { label, cause } => {
                println!("composition {}: FAILED {}", label, cause.diagnostic_line())
            }
        }
    }
}

/// 0 when every ratio completed, 1 otherwise.
pub(super) fn composition_exit_code(report: &CompositionReport) -> i32 {
    if report.has_failures() { 1 } else { 0 }
}
