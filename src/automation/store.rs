//! # automation::store
//!
//! Durable storage for the automation flag.
//!
//! ## File discipline
//! ```text
//! save(state)
//!   1. write  <file>.tmp  + fsync          ← crash here: <file> untouched
//!   2. rotate <file>.4 → .5 … .1 → .2, copy <file> → .1
//!   3. rename <file>.tmp → <file>          ← atomic on POSIX
//! ```
//! A reader therefore sees either the previous or the new record, never a
//! partial one.  A stale `.tmp` left by a crash is discarded on load.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::sync::lock;

/// Prior versions kept next to the state file.
pub const MAX_BACKUPS: usize = 5;

// ─── Record ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationState {
    pub enabled:      bool,
    pub last_updated: DateTime<Utc>,
    pub updated_by:   String,
    #[serde(default)]
    pub reason:       String,
}

impl AutomationState {
    pub fn initial(enabled: bool, source: &str) -> Self {
        Self {
            enabled,
            last_updated: Utc::now(),
            updated_by:   source.to_string(),
            reason:       "initial state".to_string(),
        }
    }
}

// ─── Store Contract ───────────────────────────────────────────────────────────

pub trait StateStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<AutomationState>, StoreError>;

    fn save(&self, state: &AutomationState) -> Result<(), StoreError>;
}

// ─── File Store ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FileStateStore {
    path:    PathBuf,
    backups: usize,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), backups: MAX_BACKUPS }
    }

    pub fn with_backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> PathBuf {
        suffixed(&self.path, "tmp")
    }

    /// `<file>.1` is the newest backup, `<file>.N` the oldest.
    pub fn backup_path(&self, n: usize) -> PathBuf {
        suffixed(&self.path, &n.to_string())
    }

    /// Step 1: write the new record to the temp file and flush it to disk.
    pub fn stage_temp(&self, state: &AutomationState) -> Result<PathBuf, StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.temp_path();
        let body = serde_json::to_vec_pretty(state)?;

        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(tmp)
    }

    /// Steps 2 and 3: rotate backups, then atomically replace the live file.
    pub fn commit(&self) -> Result<(), StoreError> {
        self.rotate_backups()?;
        fs::rename(self.temp_path(), &self.path)?;
        sync_parent(&self.path);
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), StoreError> {
        if self.backups == 0 || !self.path.exists() {
            return Ok(());
        }
        let oldest = self.backup_path(self.backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        // copy, not rename: the live file must exist until step 3
        fs::copy(&self.path, self.backup_path(1))?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<AutomationState>, StoreError> {
        let tmp = self.temp_path();
        if tmp.exists() {
            warn!(path = %tmp.display(), "discarding incomplete automation state write");
            if let Err(e) = fs::remove_file(&tmp) {
                warn!(error = %e, "could not remove stale temp file");
            }
        }

        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&self.path)?;
        let state: AutomationState = serde_json::from_slice(&raw)?;
        debug!(path = %self.path.display(), enabled = state.enabled, "automation state loaded");
        Ok(Some(state))
    }

    fn save(&self, state: &AutomationState) -> Result<(), StoreError> {
        self.stage_temp(state)?;
        self.commit()
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

// ─── Memory Store ─────────────────────────────────────────────────────────────

/// In-process store for tests and ephemeral runs. Can be told to fail saves.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state:      Mutex<Option<AutomationState>>,
    fail_saves: Mutex<bool>,
    saves:      Mutex<u64>,
}

impl MemoryStateStore {
    pub fn new(initial: Option<AutomationState>) -> Self {
        Self { state: Mutex::new(initial), ..Default::default() }
    }

    pub fn fail_saves(&self, fail: bool) {
        *lock(&self.fail_saves) = fail;
    }

    pub fn save_count(&self) -> u64 {
        *lock(&self.saves)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<AutomationState>, StoreError> {
        Ok(lock(&self.state).clone())
    }

    fn save(&self, state: &AutomationState) -> Result<(), StoreError> {
        if *lock(&self.fail_saves) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "simulated write failure",
            )));
        }
        *lock(&self.state) = Some(state.clone());
        *lock(&self.saves) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(enabled: bool, by: &str) -> AutomationState {
        AutomationState {
            enabled,
            last_updated: Utc::now(),
            updated_by:   by.into(),
            reason:       "test".into(),
        }
    }

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("automation_state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("automation_state.json"));
        store.save(&state(false, "ops")).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert!(!loaded.enabled);
        assert_eq!(loaded.updated_by, "ops");
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_crash_between_temp_and_rename_keeps_old_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("automation_state.json"));
        store.save(&state(true, "boot")).unwrap();

        // new record staged, process dies before commit
        store.stage_temp(&state(false, "ops")).unwrap();

        let reopened = FileStateStore::new(store.path());
        let loaded = reopened.load().unwrap().unwrap();
        assert!(loaded.enabled);
        assert!(!reopened.temp_path().exists());
    }

    #[test]
    fn test_truncated_temp_never_reaches_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("automation_state.json"));
        store.save(&state(false, "ops")).unwrap();
        fs::write(store.temp_path(), b"{\"enabled\": tr").unwrap();

        assert!(!store.load().unwrap().unwrap().enabled);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("automation_state.json");
        fs::write(&path, b"not json").unwrap();
        let store = FileStateStore::new(&path);
        assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_rotates_at_most_five_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("automation_state.json"));
        for i in 0..8 {
            store.save(&state(i % 2 == 0, &format!("v{i}"))).unwrap();
        }

        for n in 1..=MAX_BACKUPS {
            assert!(store.backup_path(n).exists(), "backup {n} missing");
        }
        assert!(!store.backup_path(MAX_BACKUPS + 1).exists());

        let newest: AutomationState =
            serde_json::from_slice(&fs::read(store.backup_path(1)).unwrap()).unwrap();
        assert_eq!(newest.updated_by, "v6");
        let oldest: AutomationState =
            serde_json::from_slice(&fs::read(store.backup_path(5)).unwrap()).unwrap();
        assert_eq!(oldest.updated_by, "v2");
    }

    #[test]
    fn test_memory_store_can_fail() {
        let store = MemoryStateStore::default();
        store.fail_saves(true);
        assert!(store.save(&state(true, "x")).is_err());
        assert!(store.load().unwrap().is_none());
        store.fail_saves(false);
        store.save(&state(true, "x")).unwrap();
        assert_eq!(store.save_count(), 1);
    }
}
