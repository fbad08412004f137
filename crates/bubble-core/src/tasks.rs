//! Read-only view of the user's scheduled tasks.
//!
//! Tasks are owned by an external reminder/calendar service. The engine only
//! reads the ones due today and is told when they change.

use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::error::{BubbleError, Result};

/// A scheduled item as exported by the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Identifier assigned by the task store.
    pub id: String,
    /// Whether the task is done.
    pub is_completed: bool,
    /// Whether `due` carries a time of day; date-only tasks use local midnight.
    pub has_explicit_time: bool,
    /// Due date and time.
    pub due: DateTime<Utc>,
}

impl Task {
    /// Local calendar day the task is due on.
    #[must_use]
    pub fn due_day(&self, tz: Tz) -> NaiveDate {
        self.due.with_timezone(&tz).date_naive()
    }
}

/// Local calendar day of `now` in `tz`.
#[must_use]
pub fn local_day(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Source of today's tasks.
pub trait TaskSource: Send + Sync {
    /// Every task due on the local day of `now`, completed or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn tasks_due_today(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;
}

fn due_today(tasks: impl IntoIterator<Item = Task>, now: DateTime<Utc>, tz: Tz) -> Vec<Task> {
    let today = local_day(now, tz);
    tasks
        .into_iter()
        .filter(|task| task.due_day(tz) == today)
        .collect()
}

/// Task source held in memory, fed by whoever owns the real store.
#[derive(Debug)]
pub struct InMemoryTaskSource {
    tasks: RwLock<Vec<Task>>,
    tz: Tz,
}

impl InMemoryTaskSource {
    /// Create a source with an initial task list.
    #[must_use]
    pub fn new(tasks: Vec<Task>, tz: Tz) -> Self {
        Self {
            tasks: RwLock::new(tasks),
            tz,
        }
    }

    /// Replace every task.
    pub fn replace(&self, tasks: Vec<Task>) {
        if let Ok(mut guard) = self.tasks.write() {
            *guard = tasks;
        }
    }

    /// Mark one task completed. Returns `false` when no such task exists.
    pub fn complete(&self, id: &str) -> bool {
        let Ok(mut guard) = self.tasks.write() else {
            return false;
        };
        guard
            .iter_mut()
            .find(|task| task.id == id)
            .map(|task| task.is_completed = true)
            .is_some()
    }
}

impl TaskSource for InMemoryTaskSource {
    fn tasks_due_today(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let guard = self
            .tasks
            .read()
            .map_err(|_| BubbleError::TaskSourceUnavailable("task list lock poisoned".into()))?;
        Ok(due_today(guard.iter().cloned(), now, self.tz))
    }
}

/// Task source reading a JSON array exported by the reminder service.
///
/// The file is re-read on every call; a missing file means no tasks.
#[derive(Debug, Clone)]
pub struct JsonTaskSource {
    path: PathBuf,
    tz: Tz,
}

impl JsonTaskSource {
    /// Read tasks from `path`, bucketing days in `tz`.
    pub fn new(path: impl Into<PathBuf>, tz: Tz) -> Self {
        Self {
            path: path.into(),
            tz,
        }
    }
}

impl TaskSource for JsonTaskSource {
    fn tasks_due_today(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "Task export missing, assuming no tasks");
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let tasks: Vec<Task> = serde_json::from_str(&content).map_err(|e| {
            BubbleError::TaskSourceUnavailable(format!(
                "cannot parse {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(due_today(tasks, now, self.tz))
    }
}
