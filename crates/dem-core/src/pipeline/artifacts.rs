use crate::domain::{DemError, DemResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

const PARTIAL_SUFFIX: &str = "partial";

/// Serializes `value` next to `path` and renames it into place, so readers
/// never observe a half-written artifact.
pub(crate) fn write_json_artifact<T: Serialize>(path: &Path, value: &T) -> DemResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| {
            DemError::io_system(
                "IO.ARTIFACT_DIRECTORY",
                format!(
                    "failed to create artifact directory '{}': {}",
                    parent.display(),
                    source
                ),
            )
        })?;
    }

    let bytes = serde_json::to_vec(value).map_err(|source| {
        DemError::internal(
            "SYS.ARTIFACT_ENCODE",
            format!("failed to encode artifact '{}': {}", path.display(), source),
        )
    })?;

    let partial = partial_path(path);
    fs::write(&partial, bytes).map_err(|source| {
        DemError::io_system(
            "IO.ARTIFACT_WRITE",
            format!("failed to write artifact '{}': {}", partial.display(), source),
        )
    })?;
    fs::rename(&partial, path).map_err(|source| {
        DemError::io_system(
            "IO.ARTIFACT_WRITE",
            format!(
                "failed to move artifact '{}' into place: {}",
                path.display(),
                source
            ),
        )
    })
}

pub(crate) fn read_json_artifact<T: DeserializeOwned>(path: &Path) -> DemResult<T> {
    let bytes = fs::read(path).map_err(|source| {
        DemError::io_system(
            "IO.ARTIFACT_READ",
            format!("failed to read artifact '{}': {}", path.display(), source),
        )
    })?;
    serde_json::from_slice(&bytes).map_err(|source| {
        DemError::io_system(
            "IO.ARTIFACT_CORRUPT",
            format!("failed to decode artifact '{}': {}", path.display(), source),
        )
    })
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::{read_json_artifact, write_json_artifact};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn repeated_writes_produce_identical_bytes_and_leave_no_partial_file() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("nested/artifact.json");
        let value = vec![1.5_f64, 2.5, 3.5];

        write_json_artifact(&path, &value).expect("first write should succeed");
        let first = fs::read(&path).expect("artifact should be readable");
        write_json_artifact(&path, &value).expect("second write should succeed");
        let second = fs::read(&path).expect("artifact should be readable");

        assert_eq!(first, second);
        assert!(!temp.path().join("nested/artifact.json.partial").exists());
        let decoded: Vec<f64> = read_json_artifact(&path).expect("artifact should decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn truncated_artifact_is_reported_as_corrupt() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("artifact.json");
        fs::write(&path, b"[1.0, 2.").expect("write");

        let error = read_json_artifact::<Vec<f64>>(&path).expect_err("corrupt artifact");
        assert_eq!(error.code(), "IO.ARTIFACT_CORRUPT");
    }
}
