//! Task store backed by a markdown checkbox document.
//!
//! The parse is cached against the document's modification marker and only
//! redone when the file changes. Status changes rewrite the checkbox
//! characters of the targeted entries and nothing else.

mod parse;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

pub use parse::parse_document;

/// Ordinal of a checkbox entry in the document, starting at 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches("task-");
        let n: usize = digits
            .parse()
            .map_err(|_| anyhow!("invalid task id '{}'", s))?;
        if n == 0 {
            bail!("task ids start at 1");
        }
        Ok(TaskId(n))
    }
}

/// Ordering partition. Entries without an annotation land in `Default`,
/// which sorts after every explicit group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    Explicit(u32),
    Default,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Explicit(n) => write!(f, "{}", n),
            Group::Default => write!(f, "default"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub group: Group,
    pub status: TaskStatus,
    /// 1-based line of the entry in the document.
    pub line: usize,
}

impl Task {
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DocMarker {
    modified: SystemTime,
    len: u64,
}

pub struct TaskStore {
    path: PathBuf,
    cache: Mutex<Option<(DocMarker, Vec<Task>)>>,
}

impl TaskStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn marker(&self) -> Result<DocMarker> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("no task source: {} does not exist", self.path.display())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("cannot stat {}", self.path.display()));
            }
        };
        Ok(DocMarker {
            modified: meta.modified()?,
            len: meta.len(),
        })
    }

    fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    /// Every entry in document order.
    pub fn tasks(&self) -> Result<Vec<Task>> {
        let marker = self.marker()?;
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("task cache poisoned"))?;
        if let Some((cached_marker, tasks)) = cache.as_ref()
            && *cached_marker == marker
        {
            return Ok(tasks.clone());
        }

        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("cannot read {}", self.path.display()))?;
        let tasks = parse_document(&text);
        debug!(path = %self.path.display(), count = tasks.len(), "parsed task document");
        *cache = Some((marker, tasks.clone()));
        Ok(tasks)
    }

    pub fn task(&self, id: TaskId) -> Result<Task> {
        self.tasks()?
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow!("unknown task {}", id))
    }

    /// Pending entries of one group, in document order.
    pub fn tasks_by_group(&self, group: Group) -> Result<Vec<Task>> {
        Ok(self
            .tasks()?
            .into_iter()
            .filter(|t| t.group == group && t.is_pending())
            .collect())
    }

    /// Groups with at least one pending entry, ascending, `Default` last.
    pub fn pending_groups(&self) -> Result<Vec<Group>> {
        let mut groups: Vec<Group> = self
            .tasks()?
            .iter()
            .filter(|t| t.is_pending())
            .map(|t| t.group)
            .collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    pub fn mark_complete(&self, id: TaskId) -> Result<bool> {
        Ok(self.set_status(&[id], TaskStatus::Completed)? > 0)
    }

    pub fn mark_incomplete(&self, id: TaskId) -> Result<bool> {
        Ok(self.set_status(&[id], TaskStatus::Pending)? > 0)
    }

    /// Mark several entries complete with a single write.
    pub fn mark_complete_many(&self, ids: &[TaskId]) -> Result<usize> {
        self.set_status(ids, TaskStatus::Completed)
    }

    fn set_status(&self, ids: &[TaskId], status: TaskStatus) -> Result<usize> {
        self.marker()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("cannot read {}", self.path.display()))?;
        let (updated, changed) = parse::set_status(&text, &ids, status)
            .map_err(|id| anyhow!("unknown task {} in {}", id, self.path.display()))?;

        if changed > 0 {
            let tmp = self.path.with_extension("convoy-tmp");
            std::fs::write(&tmp, updated)
                .with_context(|| format!("cannot write {}", tmp.display()))?;
            std::fs::rename(&tmp, &self.path)
                .with_context(|| format!("cannot replace {}", self.path.display()))?;
        }
        self.invalidate();
        debug!(
            path = %self.path.display(),
            changed,
            status = ?status,
            "rewrote task checkboxes"
        );
        Ok(changed)
    }
}
