//! Persistent storage for session logs, daily snapshots and known accessories.
//!
//! Every collection is a single JSON document under the data directory,
//! rewritten atomically (temp file + rename) on each change. Session logs are
//! append-only and pruned to their retention window on every write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::error::{BubbleError, Result};
use crate::registry::AccessoryRecord;

/// Days restriction sessions are kept.
pub const RESTRICTION_RETENTION_DAYS: i64 = 30;
/// Days bubble-outside sessions are kept.
pub const BUBBLE_OUTSIDE_RETENTION_DAYS: i64 = 30;
/// Days daily completion snapshots are kept.
pub const SNAPSHOT_RETENTION_DAYS: i64 = 90;

const SNAPSHOTS_FILE: &str = "daily_snapshots.json";
const ACCESSORIES_FILE: &str = "accessories.json";

/// One closed interval in a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogEntry {
    /// When the interval opened.
    pub start_time: DateTime<Utc>,
    /// When the interval closed.
    pub end_time: DateTime<Utc>,
    /// `end_time - start_time` in seconds.
    pub duration_seconds: f64,
    /// Task that was outstanding when the interval closed.
    pub related_task_id: Option<String>,
}

impl SessionLogEntry {
    /// Build an entry, deriving the duration from the two instants.
    #[must_use]
    pub fn new(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        related_task_id: Option<String>,
    ) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let duration_seconds = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
        Self {
            start_time,
            end_time,
            duration_seconds,
            related_task_id,
        }
    }
}

/// The two session logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Intervals during which restrictions were active.
    Restriction,
    /// Intervals spent outside the bubble.
    BubbleOutside,
}

impl SessionKind {
    /// File name of this log.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Restriction => "restriction_sessions.json",
            Self::BubbleOutside => "bubble_outside_sessions.json",
        }
    }

    /// How long entries are kept.
    #[must_use]
    pub fn retention(self) -> Duration {
        match self {
            Self::Restriction => Duration::days(RESTRICTION_RETENTION_DAYS),
            Self::BubbleOutside => Duration::days(BUBBLE_OUTSIDE_RETENTION_DAYS),
        }
    }
}

/// Per-day task completion counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DailySnapshot {
    /// Local calendar day.
    pub date: NaiveDate,
    /// Tasks due that day.
    pub total_tasks: u32,
    /// Of which completed.
    pub completed_tasks: u32,
}

/// Persisted form of the known-accessory list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredAccessories {
    /// Next identifier to mint. Identifiers are never reused.
    pub next_unique_id: u32,
    /// Remembered accessories, oldest first.
    pub accessories: Vec<AccessoryRecord>,
}

impl Default for StoredAccessories {
    fn default() -> Self {
        Self {
            next_unique_id: 1,
            accessories: Vec::new(),
        }
    }
}

/// Storage backend rooted at a data directory.
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance.
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Directory to store data files
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Storage at the configured directory, or the platform default.
    ///
    /// # Errors
    ///
    /// Returns an error if no default directory can be determined.
    pub fn from_config(config: &crate::config::StorageConfig) -> Result<Self> {
        match &config.data_dir {
            Some(dir) => Ok(Self::new(dir.clone())),
            None => Ok(Self::new(default_data_dir()?)),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Read a session log, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub fn load_sessions(&self, kind: SessionKind) -> Result<Vec<SessionLogEntry>> {
        self.load_json(kind.file_name())
    }

    /// Append an entry and prune everything older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or written.
    pub fn append_session(
        &self,
        kind: SessionKind,
        entry: SessionLogEntry,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut entries = self.load_sessions(kind)?;
        entries.push(entry);
        let cutoff = now - kind.retention();
        let before = entries.len();
        entries.retain(|e| e.end_time >= cutoff);
        if entries.len() != before {
            debug!(?kind, pruned = before - entries.len(), "Pruned session log");
        }
        self.save_json(kind.file_name(), &entries)
    }

    /// Read all daily snapshots, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load_snapshots(&self) -> Result<Vec<DailySnapshot>> {
        self.load_json(SNAPSHOTS_FILE)
    }

    /// Insert or replace the snapshot for its day and prune old days.
    ///
    /// Returns `false` without writing when the stored snapshot is identical.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub fn upsert_snapshot(&self, snapshot: DailySnapshot, today: NaiveDate) -> Result<bool> {
        let mut snapshots = self.load_snapshots()?;
        if snapshots.iter().any(|s| *s == snapshot) {
            return Ok(false);
        }
        snapshots.retain(|s| s.date != snapshot.date);
        snapshots.push(snapshot);
        let cutoff = today - Duration::days(SNAPSHOT_RETENTION_DAYS);
        snapshots.retain(|s| s.date > cutoff);
        snapshots.sort_by_key(|s| s.date);
        self.save_json(SNAPSHOTS_FILE, &snapshots)?;
        Ok(true)
    }

    /// Read the known-accessory list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load_accessories(&self) -> Result<StoredAccessories> {
        self.load_json(ACCESSORIES_FILE)
    }

    /// Replace the known-accessory list.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_accessories(&self, stored: &StoredAccessories) -> Result<()> {
        self.save_json(ACCESSORIES_FILE, stored)
    }

    /// Read a JSON document, returning the default value when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_json<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.data_dir.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            BubbleError::PersistenceError(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    /// Atomically replace a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn save_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        write_json_atomic(&self.data_dir.join(name), value)
    }
}

/// Write `value` as pretty JSON to a sibling temp file, then rename over `path`.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Get the default storage location.
///
/// On Linux: `/var/lib/bubble/`
/// Elsewhere: the platform data directory.
///
/// # Errors
///
/// Returns an error if no platform directory can be determined.
pub fn default_data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/var/lib/bubble"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "bubble").ok_or_else(|| {
            BubbleError::PersistenceError("Cannot determine data directory".into())
        })?;
        Ok(dirs.data_dir().to_path_buf())
    }
}
