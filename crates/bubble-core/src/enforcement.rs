//! Interface to the external usage-restriction ("shield") service.
//!
//! The engine only toggles restrictions on and off. What the target set
//! contains and how it is enforced belongs to the shield service; this crate
//! ships a file-based sink that publishes the desired state for a watcher to
//! apply.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::error::Result;
use crate::storage::write_json_atomic;

/// Externally configured set of things to restrict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct RestrictionTargets {
    /// Application identifiers.
    pub apps: Vec<String>,
    /// Application categories.
    pub categories: Vec<String>,
    /// Web domains.
    pub domains: Vec<String>,
}

impl RestrictionTargets {
    /// Whether nothing would be restricted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.categories.is_empty() && self.domains.is_empty()
    }
}

/// The enforcement collaborator driven by the policy engine.
///
/// Other writers (an onboarding flow, for instance) may change enforcement
/// state too; implementations must apply whatever they are told, last write
/// wins.
pub trait EnforcementSink: Send + Sync {
    /// Restrict the given targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the shield service could not be updated.
    fn apply_restriction(&self, targets: &RestrictionTargets) -> Result<()>;

    /// Lift every restriction.
    ///
    /// # Errors
    ///
    /// Returns an error if the shield service could not be updated.
    fn clear_all_restrictions(&self) -> Result<()>;
}

/// State document written by [`FileEnforcement`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShieldState {
    /// Whether restrictions should be in force.
    pub active: bool,
    /// What to restrict while active.
    pub targets: RestrictionTargets,
    /// When this document was written.
    pub updated_at: DateTime<Utc>,
}

/// Publishes the desired shield state as a JSON document.
#[derive(Debug, Clone)]
pub struct FileEnforcement {
    path: PathBuf,
}

impl FileEnforcement {
    /// Write shield state to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back the last published state, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the document exists but cannot be read.
    pub fn current(&self) -> Result<Option<ShieldState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn publish(&self, active: bool, targets: RestrictionTargets) -> Result<()> {
        let state = ShieldState {
            active,
            targets,
            updated_at: Utc::now(),
        };
        write_json_atomic(&self.path, &state)?;
        info!(active, path = %self.path.display(), "Published shield state");
        Ok(())
    }
}

impl EnforcementSink for FileEnforcement {
    fn apply_restriction(&self, targets: &RestrictionTargets) -> Result<()> {
        self.publish(true, targets.clone())
    }

    fn clear_all_restrictions(&self) -> Result<()> {
        self.publish(false, RestrictionTargets::default())
    }
}
