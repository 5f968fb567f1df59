use super::artifacts::{read_json_artifact, write_json_artifact};
use crate::domain::{ColumnResult, DemError, DemResult};
use globset::{Glob, GlobMatcher};
use std::fs;
use std::path::{Path, PathBuf};

const CHECKPOINT_PREFIX: &str = "dem_";
const CHECKPOINT_EXTENSION: &str = ".json";

/// Column results persisted one file per column (`dem_<column>.json`). A
/// file's presence marks the column as done for resumed runs.
#[derive(Debug, Clone)]
pub struct ColumnCheckpointStore {
    dir: PathBuf,
    matcher: GlobMatcher,
}

impl ColumnCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> DemResult<Self> {
        let pattern = format!("{CHECKPOINT_PREFIX}*{CHECKPOINT_EXTENSION}");
        let matcher = Glob::new(&pattern)
            .map_err(|source| {
                DemError::internal(
                    "SYS.CHECKPOINT_PATTERN",
                    format!("invalid checkpoint pattern '{pattern}': {source}"),
                )
            })?
            .compile_matcher();

        Ok(Self {
            dir: dir.into(),
            matcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, column: usize) -> PathBuf {
        self.dir
            .join(format!("{CHECKPOINT_PREFIX}{column}{CHECKPOINT_EXTENSION}"))
    }

    pub fn exists(&self, column: usize) -> bool {
        self.path_for(column).is_file()
    }

    pub fn save(&self, result: &ColumnResult) -> DemResult<()> {
        write_json_artifact(&self.path_for(result.column), result)
    }

    pub fn load(&self, column: usize) -> DemResult<ColumnResult> {
        read_json_artifact(&self.path_for(column))
    }

    /// Column indices of every checkpoint on disk, parsed from the file
    /// names and sorted.
    pub fn list_columns(&self) -> DemResult<Vec<usize>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|source| {
            DemError::io_system(
                "IO.CHECKPOINT_LIST",
                format!(
                    "failed to list checkpoints in '{}': {}",
                    self.dir.display(),
                    source
                ),
            )
        })?;

        let mut columns = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| {
                DemError::io_system(
                    "IO.CHECKPOINT_LIST",
                    format!(
                        "failed to list checkpoints in '{}': {}",
                        self.dir.display(),
                        source
                    ),
                )
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !self.matcher.is_match(name) {
                continue;
            }
            let column = parse_column_index(name).ok_or_else(|| {
                DemError::io_system(
                    "IO.CHECKPOINT_NAME",
                    format!(
                        "checkpoint '{}' in '{}' does not encode a column index",
                        name,
                        self.dir.display()
                    ),
                )
            })?;
            columns.push(column);
        }

        columns.sort_unstable();
        Ok(columns)
    }

    pub fn clear(&self) -> DemResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&self.dir).map_err(|source| {
            DemError::io_system(
                "IO.CHECKPOINT_CLEAR",
                format!(
                    "failed to remove checkpoint directory '{}': {}",
                    self.dir.display(),
                    source
                ),
            )
        })
    }
}

/// `dem_17.json` -> `Some(17)`.
pub fn parse_column_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_EXTENSION)?
        .parse()
        .ok()
}
