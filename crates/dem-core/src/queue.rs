//! Persistent list of observations to process.
//!
//! Each item moves `pending -> in_progress -> done` and every transition is
//! written back immediately. An item left `in_progress` by an interrupted
//! run stays there until it is explicitly reclaimed.

use crate::domain::{DemError, DemResult};
use crate::pipeline::artifacts::write_json_artifact;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Pending,
    InProgress,
    Done,
}

impl WorkState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }
}

impl Display for WorkState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub state: WorkState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct QueueFile {
    items: Vec<WorkItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueue {
    path: PathBuf,
    items: Vec<WorkItem>,
}

impl JobQueue {
    pub fn load(path: impl Into<PathBuf>) -> DemResult<Self> {
        let path = path.into();
        let source = fs::read_to_string(&path).map_err(|source| {
            DemError::io_system(
                "IO.QUEUE_READ",
                format!("failed to read job queue '{}': {}", path.display(), source),
            )
        })?;
        let file: QueueFile = serde_json::from_str(&source).map_err(|source| {
            DemError::input_validation(
                "INPUT.QUEUE_PARSE",
                format!("failed to parse job queue '{}': {}", path.display(), source),
            )
        })?;
        Ok(Self {
            path,
            items: file.items,
        })
    }

    /// Builds a queue of pending items from a plain list, one identifier per
    /// line. Blank lines and `#` comments are skipped, duplicates collapse
    /// onto their first occurrence.
    pub fn import_list(list: impl AsRef<Path>, path: impl Into<PathBuf>) -> DemResult<Self> {
        let list = list.as_ref();
        let source = fs::read_to_string(list).map_err(|source| {
            DemError::io_system(
                "IO.QUEUE_READ",
                format!("failed to read job list '{}': {}", list.display(), source),
            )
        })?;

        let mut seen = BTreeSet::new();
        let items = source
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter(|line| seen.insert(line.to_string()))
            .map(|line| WorkItem {
                id: line.to_string(),
                state: WorkState::Pending,
            })
            .collect();

        let queue = Self {
            path: path.into(),
            items,
        };
        queue.save()?;
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn state(&self, id: &str) -> Option<WorkState> {
        self.items
            .iter()
            .find(|item| item.id == id)
            .map(|item| item.state)
    }

    pub fn ids_in(&self, state: WorkState) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| item.state == state)
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn save(&self) -> DemResult<()> {
        write_json_artifact(
            &self.path,
            &QueueFile {
                items: self.items.clone(),
            },
        )
    }

    /// Moves the first pending item to `in_progress` and returns its id.
    pub fn claim_next(&mut self) -> DemResult<Option<String>> {
        let Some(item) = self
            .items
            .iter_mut()
            .find(|item| item.state == WorkState::Pending)
        else {
            return Ok(None);
        };
        item.state = WorkState::InProgress;
        let id = item.id.clone();
        self.save()?;
        Ok(Some(id))
    }

    pub fn complete(&mut self, id: &str) -> DemResult<()> {
        self.transition(id, WorkState::InProgress, WorkState::Done)
    }

    /// Returns an interrupted item to `pending` once the caller has decided
    /// it is safe to run again.
    pub fn reclaim(&mut self, id: &str) -> DemResult<()> {
        self.transition(id, WorkState::InProgress, WorkState::Pending)
    }

    fn transition(&mut self, id: &str, from: WorkState, to: WorkState) -> DemResult<()> {
        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| {
                DemError::input_validation(
                    "INPUT.QUEUE_ITEM",
                    format!("job queue has no item '{id}'"),
                )
            })?;
        if item.state != from {
            return Err(DemError::input_validation(
                "INPUT.QUEUE_TRANSITION",
                format!(
                    "item '{}' is {} and cannot move to {}",
                    id, item.state, to
                ),
            ));
        }
        item.state = to;
        self.save()
    }
}
