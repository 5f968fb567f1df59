//! The two parallel stages: per-column DEM estimation with checkpoints and
//! per-pixel composition.

pub(crate) mod artifacts;
pub mod checkpoint;
pub mod combiner;
pub mod composition;
pub mod coordinator;
pub mod estimator;

pub use checkpoint::{ColumnCheckpointStore, parse_column_index};
pub use combiner::{FrameShape, combine_columns};
pub use composition::{
    CompositionMap, CompositionReport, RatioOutcome, compute_ratio, corrected_metadata,
    run_composition_stage,
};
pub use coordinator::{ColumnOutcome, build_worker_pool, run_columns};
pub use estimator::{PixelEstimator, SelectedLines};
pub use rayon::ThreadPool;

use crate::config::RunContext;
use crate::domain::{CombinedResult, DemError, DemResult, Observation};
use crate::emissivity::EmissivityProvider;
use crate::numerics::InversionOperator;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemStageReport {
    pub computed: usize,
    pub resumed: usize,
    pub recomputed: usize,
    pub combined_path: PathBuf,
}

/// Estimates every column not already checkpointed, merges the columns and
/// writes the combined artifact. Checkpoints are removed afterwards unless
/// the configuration retains them.
pub fn run_dem_stage(
    pool: &ThreadPool,
    observation: &Observation,
    emissivity: &dyn EmissivityProvider,
    operator: &dyn InversionOperator,
    context: &RunContext,
) -> DemResult<(CombinedResult, DemStageReport)> {
    let store = ColumnCheckpointStore::new(context.checkpoint_dir())?;
    let estimator = PixelEstimator::new(context, emissivity, operator);
    info!(
        run = %context.run_name,
        rows = observation.rows(),
        columns = observation.columns(),
        workers = pool.current_num_threads(),
        "starting DEM stage"
    );

    let outcomes = run_columns(pool, observation, &estimator, &store)?;
    let count = |wanted: ColumnOutcome| {
        outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == wanted)
            .count()
    };
    let shape = FrameShape {
        rows: observation.rows(),
        columns: observation.columns(),
        bins: context.grids.native.bins(),
    };
    let combined = combine_columns(&store, shape)?;

    let combined_path = context.combined_path();
    artifacts::write_json_artifact(&combined_path, &combined)?;
    if !context.config.retain_checkpoints {
        store.clear()?;
    }

    let report = DemStageReport {
        computed: count(ColumnOutcome::Computed),
        resumed: count(ColumnOutcome::Resumed),
        recomputed: count(ColumnOutcome::Recomputed),
        combined_path,
    };
    info!(
        computed = report.computed,
        resumed = report.resumed,
        recomputed = report.recomputed,
        artifact = %report.combined_path.display(),
        "DEM stage finished"
    );
    Ok((combined, report))
}

pub fn load_combined(path: impl AsRef<Path>) -> DemResult<CombinedResult> {
    let path = path.as_ref();
    let combined: CombinedResult = artifacts::read_json_artifact(path)?;
    if !combined.is_consistent() {
        return Err(DemError::io_system(
            "IO.ARTIFACT_CORRUPT",
            format!(
                "combined artifact '{}' has maps or axes that disagree with its DEM cube",
                path.display()
            ),
        ));
    }
    Ok(combined)
}
