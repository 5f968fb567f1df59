use super::checkpoint::ColumnCheckpointStore;
use super::estimator::PixelEstimator;
use crate::domain::{DemError, DemResult, Observation};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnOutcome {
    /// No checkpoint existed; the column was estimated and saved.
    Computed,
    /// A valid checkpoint existed; nothing was recomputed.
    Resumed,
    /// A checkpoint existed but could not be trusted and was rewritten.
    Recomputed,
}

/// Dedicated pool so the worker count does not leak into the global rayon
/// pool of the host process.
pub fn build_worker_pool(workers: usize) -> DemResult<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|index| format!("dem-worker-{index}"))
        .build()
        .map_err(|source| {
            DemError::internal(
                "SYS.WORKER_POOL",
                format!("failed to start {workers} workers: {source}"),
            )
        })
}

/// Estimates every column of `observation` that has no trusted checkpoint
/// and returns one `(column, outcome)` pair per column, in column order.
pub fn run_columns(
    pool: &ThreadPool,
    observation: &Observation,
    estimator: &PixelEstimator<'_>,
    store: &ColumnCheckpointStore,
) -> DemResult<Vec<(usize, ColumnOutcome)>> {
    pool.install(|| {
        (0..observation.columns())
            .into_par_iter()
            .map(|column| {
                process_column(observation, estimator, store, column).map(|outcome| (column, outcome))
            })
            .collect()
    })
}

fn process_column(
    observation: &Observation,
    estimator: &PixelEstimator<'_>,
    store: &ColumnCheckpointStore,
    column: usize,
) -> DemResult<ColumnOutcome> {
    let mut outcome = ColumnOutcome::Computed;
    if store.exists(column) {
        match store.load(column) {
            Ok(stored)
                if stored.is_consistent_with(column, observation.rows(), estimator.native_bins()) =>
            {
                debug!(column, "checkpoint present; skipping column");
                return Ok(ColumnOutcome::Resumed);
            }
            Ok(_) => {
                warn!(column, "checkpoint does not match the observation shape; recomputing");
            }
            Err(error) => {
                warn!(column, %error, "unreadable checkpoint; recomputing");
            }
        }
        outcome = ColumnOutcome::Recomputed;
    }

    let result = estimator.estimate_column(observation, column)?;
    store.save(&result)?;
    debug!(column, rows = result.rows(), "column checkpointed");
    Ok(outcome)
}
