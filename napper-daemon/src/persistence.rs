//! Crash-safe persistence of per-host supervisor state.
//!
//! One YAML snapshot per daemon at `<state_dir>/state.yml`, written through
//! a temp file and an atomic rename so a crash mid-write never leaves a
//! half-written snapshot. A snapshot that fails to parse is moved aside to
//! `state.yml.backup.<epoch>` and the daemon starts fresh.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::errors::{NapperError, Result};
use crate::state::{AppState, AppStatus, TransitionRecord};

/// Canonical snapshot file name inside the state directory
pub const STATE_FILE: &str = "state.yml";

/// History entries persisted per host (in-memory history is longer)
const PERSISTED_HISTORY_LIMIT: usize = 10;

/// On-disk snapshot schema
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub saved_at: DateTime<Utc>,
    pub version: String,
    pub states: BTreeMap<String, PersistedAppState>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedAppState {
    pub current_state: AppStatus,
    pub state_changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

pub struct StatePersistence {
    state_dir: PathBuf,
    clock: SharedClock,
}

impl StatePersistence {
    pub fn new(state_dir: PathBuf, clock: SharedClock) -> Self {
        Self { state_dir, clock }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    /// Serialize the full host map and atomically replace the snapshot.
    pub fn save(&self, apps: &HashMap<String, AppState>) -> Result<()> {
        let states = apps
            .iter()
            .map(|(host, app)| {
                let skip = app.history().len().saturating_sub(PERSISTED_HISTORY_LIMIT);
                let history: Vec<TransitionRecord> = app.history().skip(skip).cloned().collect();
                (
                    host.clone(),
                    PersistedAppState {
                        current_state: app.status(),
                        state_changed_at: app.state_changed_at(),
                        startup_started_at: app.startup_started_at(),
                        history,
                    },
                )
            })
            .collect();

        let snapshot = PersistedSnapshot {
            saved_at: self.clock.now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            states,
        };

        let content = serde_yaml::to_string(&snapshot)
            .map_err(|e| NapperError::Persistence(format!("Failed to serialize snapshot: {}", e)))?;

        self.write_atomic(&self.state_path(), content.as_bytes())?;
        debug!("Saved state snapshot for {} hosts", apps.len());
        Ok(())
    }

    /// Load the snapshot and rebuild AppStates through forced restore
    /// transitions. Any failure logs and yields an empty map so the daemon
    /// starts fresh rather than refusing to run.
    pub fn load(&self) -> HashMap<String, AppState> {
        let path = self.state_path();
        if !path.exists() {
            debug!("No state snapshot at {:?}, starting fresh", path);
            return HashMap::new();
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read state snapshot {:?}: {}", path, e);
                return HashMap::new();
            }
        };

        let snapshot: PersistedSnapshot = match serde_yaml::from_str(&content) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("State snapshot {:?} is corrupt: {}", path, e);
                self.backup_corrupt_file(&path);
                return HashMap::new();
            }
        };

        let apps: HashMap<String, AppState> = snapshot
            .states
            .into_iter()
            .map(|(host, persisted)| {
                let app = AppState::restore(
                    host.clone(),
                    persisted.current_state,
                    persisted.state_changed_at,
                    persisted.startup_started_at,
                    persisted.history,
                );
                (host, app)
            })
            .collect();

        info!(
            "Restored {} hosts from snapshot saved at {}",
            apps.len(),
            snapshot.saved_at
        );
        apps
    }

    /// Delete the oldest corrupt-file backups beyond `keep`.
    pub fn cleanup_backups(&self, keep: usize) -> Result<()> {
        let mut backups: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix("state.yml.backup.") {
                if let Ok(epoch) = suffix.parse::<u64>() {
                    backups.push((epoch, entry.path()));
                }
            }
        }

        backups.sort_by_key(|(epoch, _)| *epoch);
        let excess = backups.len().saturating_sub(keep);
        for (_, path) in backups.into_iter().take(excess) {
            debug!("Removing old state backup {:?}", path);
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn backup_corrupt_file(&self, path: &Path) {
        let epoch = self.clock.now().timestamp().max(0);
        let backup = self.state_dir.join(format!("{}.backup.{}", STATE_FILE, epoch));
        match std::fs::rename(path, &backup) {
            Ok(()) => warn!("Moved corrupt snapshot aside to {:?}", backup),
            Err(e) => warn!("Failed to move corrupt snapshot aside: {}", e),
        }
    }

    /// Write through a temp file in the same directory, fsync, then rename
    /// over the canonical path (mode 0644).
    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.state_dir).map_err(|e| {
            NapperError::Persistence(format!(
                "Failed to create temp file in '{}': {}",
                self.state_dir.display(),
                e
            ))
        })?;

        tmp.write_all(content)
            .map_err(|e| NapperError::Persistence(format!("Failed to write temp file: {}", e)))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| NapperError::Persistence(format!("Failed to sync temp file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))
                .map_err(|e| {
                    NapperError::Persistence(format!("Failed to set snapshot permissions: {}", e))
                })?;
        }

        tmp.persist(path).map_err(|e| {
            NapperError::Persistence(format!("Failed to persist '{}': {}", path.display(), e))
        })?;
        Ok(())
    }
}
