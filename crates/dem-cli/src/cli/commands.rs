use super::CliError;
use super::helpers::*;
use dem_core::config::PipelineConfig;
use dem_core::domain::RatioDefinition;
use dem_core::emissivity::TabulatedEmissivity;
use dem_core::numerics::RegularizedInversion;
use dem_core::pipeline::{ThreadPool, load_combined, run_composition_stage, run_dem_stage};
use dem_core::queue::{JobQueue, WorkState};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(clap::Args)]
pub(super) struct SharedFlags {
    /// Emissivity tables JSON
    #[arg(long)]
    emissivity: PathBuf,

    /// Directory receiving checkpoints and artifacts
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Pipeline configuration JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker pool size (default: 15/16 of available cores, at most 60)
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(clap::Args)]
pub(super) struct DemArgs {
    /// Observation JSON
    observation: PathBuf,

    #[command(flatten)]
    shared: SharedFlags,
}

#[derive(clap::Args)]
pub(super) struct CompositionArgs {
    /// Observation JSON
    observation: PathBuf,

    /// Combined DEM artifact (default: <output-dir>/<run>_dem_combined.json)
    #[arg(long)]
    combined: Option<PathBuf>,

    /// Ratio definitions JSON (default: sis, CaAr, FeS)
    #[arg(long)]
    ratios: Option<PathBuf>,

    #[command(flatten)]
    shared: SharedFlags,
}

#[derive(clap::Args)]
pub(super) struct RunArgs {
    /// Observation JSON
    observation: PathBuf,

    /// Ratio definitions JSON (default: sis, CaAr, FeS)
    #[arg(long)]
    ratios: Option<PathBuf>,

    #[command(flatten)]
    shared: SharedFlags,
}

#[derive(clap::Args)]
pub(super) struct QueueArgs {
    /// Job queue JSON
    #[arg(long)]
    queue: PathBuf,

    /// Plain list of observation paths, one per line, that replaces the queue
    #[arg(long)]
    import: Option<PathBuf>,

    /// Return items left in progress by an interrupted run to pending
    #[arg(long)]
    reclaim_in_progress: bool,

    /// Ratio definitions JSON (default: sis, CaAr, FeS)
    #[arg(long)]
    ratios: Option<PathBuf>,

    #[command(flatten)]
    shared: SharedFlags,
}

pub(super) fn run_dem_command(args: DemArgs) -> Result<i32, CliError> {
    let config = load_config(args.shared.config.as_deref(), args.shared.workers)?;
    let session = open_session(&args.observation, args.shared.output_dir, config)?;
    let emissivity = load_emissivity(&args.shared.emissivity)?;
    let pool = start_pool(&session.context.config)?;

    let (_, report) = run_dem_stage(
        &pool,
        &session.observation,
        &emissivity,
        &RegularizedInversion,
        &session.context,
    )
    .map_err(CliError::Compute)?;
    print_dem_report(&report);
    Ok(0)
}

pub(super) fn run_composition_command(args: CompositionArgs) -> Result<i32, CliError> {
    let config = load_config(args.shared.config.as_deref(), args.shared.workers)?;
    let session = open_session(&args.observation, args.shared.output_dir, config)?;
    let emissivity = load_emissivity(&args.shared.emissivity)?;
    let ratios = load_ratios(args.ratios.as_deref())?;
    let pool = start_pool(&session.context.config)?;

    let combined_path = args
        .combined
        .unwrap_or_else(|| session.context.combined_path());
    let combined = load_combined(&combined_path).map_err(CliError::Compute)?;
    let report = run_composition_stage(
        &pool,
        &session.observation,
        &combined,
        &emissivity,
        &ratios,
        &session.context,
    )
    .map_err(CliError::Compute)?;
    print_composition_report(&report);
    Ok(composition_exit_code(&report))
}

pub(super) fn run_run_command(args: RunArgs) -> Result<i32, CliError> {
    let config = load_config(args.shared.config.as_deref(), args.shared.workers)?;
    let emissivity = load_emissivity(&args.shared.emissivity)?;
    let ratios = load_ratios(args.ratios.as_deref())?;
    let pool = start_pool(&config)?;

    run_observation(
        &pool,
        &args.observation,
        args.shared.output_dir,
        &emissivity,
        &ratios,
        config,
    )
}

pub(super) fn run_queue_command(args: QueueArgs) -> Result<i32, CliError> {
    let config = load_config(args.shared.config.as_deref(), args.shared.workers)?;
    let mut queue = match &args.import {
        Some(list) => JobQueue::import_list(list, &args.queue),
        None => JobQueue::load(&args.queue),
    }
    .map_err(CliError::Compute)?;

    for id in queue.ids_in(WorkState::InProgress) {
        if args.reclaim_in_progress {
            info!(item = %id, "reclaiming interrupted item");
            queue.reclaim(&id).map_err(CliError::Compute)?;
        } else {
            warn!(
                item = %id,
                "item was left in progress by an earlier run; pass --reclaim-in-progress to rerun it"
            );
        }
    }

    let emissivity = load_emissivity(&args.shared.emissivity)?;
    let ratios = load_ratios(args.ratios.as_deref())?;
    let pool = start_pool(&config)?;

    let mut exit_code = 0;
    while let Some(id) = queue.claim_next().map_err(CliError::Compute)? {
        let observation = PathBuf::from(&id);
        let output_dir = args.shared.output_dir.join(run_name_for(&observation));
        info!(item = %id, output = %output_dir.display(), "processing queue item");

        match run_observation(&pool, &observation, output_dir, &emissivity, &ratios, config.clone()) {
            Ok(code) => {
                queue.complete(&id).map_err(CliError::Compute)?;
                exit_code = exit_code.max(code);
            }
            Err(failure) => {
                let failure = failure.as_dem_error();
                error!(item = %id, error = %failure, "queue item failed; left in progress");
                if exit_code <= 1 {
                    exit_code = failure.exit_code();
                }
            }
        }
    }

    Ok(exit_code)
}

fn run_observation(
    pool: &ThreadPool,
    observation_path: &Path,
    output_dir: PathBuf,
    emissivity: &TabulatedEmissivity,
    ratios: &[RatioDefinition],
    config: PipelineConfig,
) -> Result<i32, CliError> {
    let session = open_session(observation_path, output_dir, config)?;
    let (combined, dem_report) = run_dem_stage(
        pool,
        &session.observation,
        emissivity,
        &RegularizedInversion,
        &session.context,
    )
    .map_err(CliError::Compute)?;
    print_dem_report(&dem_report);

    let report = run_composition_stage(
        pool,
        &session.observation,
        &combined,
        emissivity,
        ratios,
        &session.context,
    )
    .map_err(CliError::Compute)?;
    print_composition_report(&report);
    Ok(composition_exit_code(&report))
}
