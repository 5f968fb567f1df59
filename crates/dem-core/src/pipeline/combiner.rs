use super::checkpoint::ColumnCheckpointStore;
use crate::domain::{CombinedResult, Cube, DemError, DemResult, Frame};
use std::collections::BTreeSet;

/// Frame dimensions the checkpoints must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub rows: usize,
    pub columns: usize,
    pub bins: usize,
}

/// Merges every column checkpoint into full-frame arrays. Each column is
/// placed by the index parsed from its file name; a missing, unexpected or
/// malformed column aborts the merge.
pub fn combine_columns(
    store: &ColumnCheckpointStore,
    shape: FrameShape,
) -> DemResult<CombinedResult> {
    let present: BTreeSet<usize> = store.list_columns()?.into_iter().collect();
    if let Some(column) = present.iter().find(|column| **column >= shape.columns) {
        return Err(DemError::computation(
            "COMPUTE.COMBINE_UNEXPECTED_COLUMN",
            format!(
                "checkpoint for column {} found in '{}' but the frame has {} columns",
                column,
                store.dir().display(),
                shape.columns
            ),
        ));
    }
    let missing: Vec<usize> = (0..shape.columns)
        .filter(|column| !present.contains(column))
        .collect();
    if !missing.is_empty() {
        return Err(DemError::computation(
            "COMPUTE.COMBINE_MISSING_COLUMN",
            format!(
                "{} column checkpoint(s) missing from '{}', first is column {}",
                missing.len(),
                store.dir().display(),
                missing[0]
            ),
        ));
    }

    let mut dem = Cube::zeros(shape.rows, shape.columns, shape.bins);
    let mut chi_square = Frame::zeros(shape.rows, shape.columns);
    let mut lines_used = Frame::zeros(shape.rows, shape.columns);
    let mut axes = None;

    for column in present {
        let result = store.load(column)?;
        if !result.is_consistent_with(column, shape.rows, shape.bins) {
            return Err(DemError::io_system(
                "IO.CHECKPOINT_CORRUPT",
                format!(
                    "checkpoint '{}' does not hold {} rows of {} bins for column {}",
                    store.path_for(column).display(),
                    shape.rows,
                    shape.bins,
                    column
                ),
            ));
        }

        for row in 0..shape.rows {
            dem.pixel_mut(row, column).copy_from_slice(&result.dem[row]);
            chi_square.set(row, column, result.chi_square[row]);
            lines_used.set(row, column, result.lines_used[row].len() as f64);
        }
        if axes.is_none() {
            axes = Some((result.log_temperatures, result.working_log_temperatures));
        }
    }

    let (log_temperatures, working_log_temperatures) = axes.unwrap_or_default();
    Ok(CombinedResult {
        dem,
        chi_square,
        lines_used,
        log_temperatures,
        working_log_temperatures,
    })
}

#[cfg(test)]
mod tests {
    use super::{FrameShape, combine_columns};
    use crate::domain::{ColumnResult, PixelDem};
    use crate::pipeline::checkpoint::ColumnCheckpointStore;
    use tempfile::TempDir;

    fn column(index: usize, rows: usize) -> ColumnResult {
        let pixels = (0..rows)
            .map(|row| PixelDem {
                dem: vec![index as f64, row as f64, 1.0],
                chi_square: (index * 10 + row) as f64,
                lines_used: vec!["fe_a".to_string(); row + 1],
            })
            .collect();
        ColumnResult::from_pixels(index, pixels, vec![5.0, 5.1, 5.2], vec![5.1])
    }

    const SHAPE: FrameShape = FrameShape {
        rows: 2,
        columns: 3,
        bins: 3,
    };

    #[test]
    fn every_plane_matches_its_checkpoint() {
        let temp = TempDir::new().expect("tempdir should be created");
        let store = ColumnCheckpointStore::new(temp.path()).expect("store");
        for index in [2, 0, 1] {
            store.save(&column(index, 2)).expect("save");
        }

        let combined = combine_columns(&store, SHAPE).expect("combine");

        for index in 0..3 {
            let stored = store.load(index).expect("load");
            for row in 0..2 {
                assert_eq!(combined.dem.pixel(row, index), stored.dem[row].as_slice());
                assert_eq!(combined.chi_square.get(row, index), stored.chi_square[row]);
                assert_eq!(
                    combined.lines_used.get(row, index),
                    stored.lines_used[row].len() as f64
                );
            }
        }
        assert_eq!(combined.log_temperatures, vec![5.0, 5.1, 5.2]);
    }

    #[test]
    fn missing_column_is_reported() {
        let temp = TempDir::new().expect("tempdir should be created");
        let store = ColumnCheckpointStore::new(temp.path()).expect("store");
        store.save(&column(0, 2)).expect("save");
        store.save(&column(2, 2)).expect("save");

        let error = combine_columns(&store, SHAPE).expect_err("column 1 missing");
        assert_eq!(error.code(), "COMPUTE.COMBINE_MISSING_COLUMN");
    }

    #[test]
    fn out_of_frame_and_short_columns_are_rejected() {
        let temp = TempDir::new().expect("tempdir should be created");
        let store = ColumnCheckpointStore::new(temp.path()).expect("store");
        for index in 0..4 {
            store.save(&column(index, 2)).expect("save");
        }
        let error = combine_columns(&store, SHAPE).expect_err("column 3 is outside");
        assert_eq!(error.code(), "COMPUTE.COMBINE_UNEXPECTED_COLUMN");

        let temp = TempDir::new().expect("tempdir should be created");
        let store = ColumnCheckpointStore::new(temp.path()).expect("store");
        store.save(&column(0, 2)).expect("save");
        store.save(&column(1, 1)).expect("save");
        store.save(&column(2, 2)).expect("save");
        let error = combine_columns(&store, SHAPE).expect_err("column 1 is short");
        assert_eq!(error.code(), "IO.CHECKPOINT_CORRUPT");
    }
}
