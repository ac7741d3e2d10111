//! Which rule batch is currently applied, and its on-disk mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::error::{CoordinatorError, CoordinatorResult};
use crate::rules::RuleBatch;

/// A batch whose setup succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedBatch {
    /// The batch, including its cleanup steps.
    pub batch: RuleBatch,
    /// Generation of the engine process the rules point at.
    pub generation: u64,
    /// When setup finished.
    pub applied_at: DateTime<Utc>,
}

impl AppliedBatch {
    /// Record `batch` as applied now for engine `generation`.
    pub fn new(batch: RuleBatch, generation: u64) -> Self {
        Self {
            batch,
            generation,
            applied_at: Utc::now(),
        }
    }
}

/// JSON file mirroring the applied batch across supervisor restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Journal at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Journal location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded batch, `None` when no journal exists.
    pub fn load(&self) -> CoordinatorResult<Option<AppliedBatch>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CoordinatorError::Journal {
                    action: "read",
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| CoordinatorError::JournalCorrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Replace the journal with `applied`: write a sibling temp file, fsync,
    /// rename over the journal.
    pub fn store(&self, applied: &AppliedBatch) -> CoordinatorResult<()> {
        let io_err = |source: std::io::Error| CoordinatorError::Journal {
            action: "write",
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(applied).map_err(|e| io_err(std::io::Error::other(e)))?;
        let mut file = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.as_file().sync_all().map_err(io_err)?;
        file.persist(&self.path).map_err(|e| io_err(e.error))?;

        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
        debug!("Journaled {} batch to {}", applied.batch.mode(), self.path.display());
        Ok(())
    }

    /// Move an unreadable journal to `<path>.corrupt`, replacing any earlier
    /// one, and return the new location.
    pub fn set_aside(&self) -> CoordinatorResult<PathBuf> {
        let mut target = self.path.clone().into_os_string();
        target.push(".corrupt");
        let target = PathBuf::from(target);
        fs::rename(&self.path, &target).map_err(|source| CoordinatorError::Journal {
            action: "move aside",
            path: self.path.clone(),
            source,
        })?;
        Ok(target)
    }

    /// Remove the journal. A missing journal is not an error.
    pub fn clear(&self) -> CoordinatorResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CoordinatorError::Journal {
                action: "remove",
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// The single record of what is applied to the host.
///
/// The in-memory value is authoritative. Journal failures are logged and
/// never block recording or clearing.
#[derive(Debug, Default)]
pub struct AppliedRulesRecord {
    current: Option<AppliedBatch>,
    journal: Option<Journal>,
}

impl AppliedRulesRecord {
    /// Record kept in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record mirrored to `journal`.
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            current: None,
            journal: Some(journal),
        }
    }

    /// Mirror, if any.
    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// Applied batch.
    pub fn current(&self) -> Option<&AppliedBatch> {
        self.current.as_ref()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Record `applied`, replacing whatever was recorded.
    pub fn set(&mut self, applied: AppliedBatch) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.store(&applied)
        {
            warn!("{}", e);
        }
        self.current = Some(applied);
    }

    /// Forget the recorded batch and return it.
    pub fn take(&mut self) -> Option<AppliedBatch> {
        let taken = self.current.take();
        if taken.is_some()
            && let Some(journal) = &self.journal
            && let Err(e) = journal.clear()
        {
            warn!("{}", e);
        }
        taken
    }
}
