//! Persisted per-file state: staged flags, manual tags and bundle
//! associations, stored as a single JSON document.
//!
//! Entries are never dropped because of ignore patterns. The only operation
//! that removes entries is [`StateStore::prune_missing`], and it keeps any
//! entry that still carries user metadata.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::storage::{self, StorePaths};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use log;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStateEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_changed: bool,
    #[serde(default)]
    pub is_staged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_bundle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundle_ids: Vec<String>,
    #[serde(default)]
    pub tags: IndexSet<String>,
    /// Fields written by other tools or newer versions, kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FileStateEntry {
    pub fn for_path(path: &str) -> Self {
        let (directory, name) = split_path(path);
        Self {
            name: name.to_string(),
            directory: directory.to_string(),
            ..Self::default()
        }
    }

    pub fn has_bundle_association(&self) -> bool {
        self.master_bundle_id.is_some() || !self.bundle_ids.is_empty()
    }

    /// Tags, staged flag or a bundle association: anything a user applied
    /// that must outrank automatic exclusion.
    pub fn has_user_metadata(&self) -> bool {
        !self.tags.is_empty() || self.is_staged || self.has_bundle_association()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterBundleRef {
    pub id: String,
    pub created: DateTime<Utc>,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchState {
    #[serde(default = "Utc::now")]
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub files: BTreeMap<String, FileStateEntry>,
    #[serde(default)]
    pub master_bundle: Option<MasterBundleRef>,
}

impl Default for WatchState {
    fn default() -> Self {
        Self {
            last_accessed: Utc::now(),
            files: BTreeMap::new(),
            master_bundle: None,
        }
    }
}

impl WatchState {
    pub fn entry_mut(&mut self, path: &str) -> &mut FileStateEntry {
        let key = normalize_key(path);
        self.files
            .entry(key)
            .or_insert_with_key(|k| FileStateEntry::for_path(k))
    }

    pub fn tags_for(&self, path: &str) -> Vec<String> {
        self.files
            .get(path)
            .map(|e| e.tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn staged_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, e)| e.is_staged)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn paths_with_tag(&self, tag: &str) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, e)| e.tags.contains(tag))
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    load_retries: u32,
    retry_delay: Duration,
}

impl StateStore {
    pub fn new(path: &Path) -> Self {
        let defaults = Config::default();
        Self {
            path: path.to_path_buf(),
            load_retries: defaults.state.load_retries,
            retry_delay: defaults.get_state_retry_delay(),
        }
    }

    pub fn from_config(paths: &StorePaths, config: &Config) -> Self {
        Self {
            path: paths.state_file(),
            load_retries: config.state.load_retries,
            retry_delay: config.get_state_retry_delay(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> WatchState {
        self.load_with_report().0
    }

    /// Loads the state, returning alongside it the error that forced a reset
    /// to defaults, if any. Never fails: a locked or unreadable file is
    /// retried, then treated as empty; a corrupt document is copied aside to
    /// `<file>.corrupt` and replaced by a fresh state.
    pub fn load_with_report(&self) -> (WatchState, Option<AppError>) {
        match self.read_document() {
            Ok(Some(state)) => {
                log::trace!("Loaded state with {} file entries.", state.files.len());
                (state, None)
            }
            Ok(None) => (WatchState::default(), None),
            Err(err @ AppError::StateCorrupt { .. }) => {
                log::error!("{}; resetting to an empty state.", err);
                (WatchState::default(), Some(err))
            }
            Err(err) => {
                log::warn!("{}; using empty state.", err);
                (WatchState::default(), Some(err))
            }
        }
    }

    /// Merge-safe save: entries present on disk but absent from `state` are
    /// carried over untouched; entries in `state` replace their on-disk
    /// counterparts. Nothing is written when the document on disk exists but
    /// cannot be read.
    pub fn save(&self, state: &WatchState) -> Result<()> {
        let mut merged = state.clone();
        match self.read_document() {
            Ok(Some(on_disk)) => {
                for (path, entry) in on_disk.files {
                    merged.files.entry(path).or_insert(entry);
                }
            }
            Ok(None) => {}
            Err(AppError::StateCorrupt { .. }) => {
                log::warn!("Overwriting corrupt state at {}", self.path.display());
            }
            Err(e) => return Err(e),
        }
        self.write_state(&merged)
    }

    /// Read-modify-write of the whole document. Not atomic across processes;
    /// callers serialize access per project. A document that exists but
    /// cannot be read is left untouched and the read error is returned.
    pub fn update<R>(&self, f: impl FnOnce(&mut WatchState) -> R) -> Result<R> {
        let mut state = match self.read_document() {
            Ok(state) => state.unwrap_or_default(),
            Err(err @ AppError::StateCorrupt { .. }) => {
                log::error!("{}; resetting to an empty state.", err);
                WatchState::default()
            }
            Err(e) => return Err(e),
        };
        let result = f(&mut state);
        self.write_state(&state)?;
        Ok(result)
    }

    /// The parsed document, `None` if there is none. Read failures are
    /// retried `load_retries` times. An unparseable document (including one
    /// that is not UTF-8) is copied to `<file>.corrupt` before
    /// `StateCorrupt` is returned.
    fn read_document(&self) -> Result<Option<WatchState>> {
        let mut attempt = 0;
        let bytes = loop {
            match fs::read(&self.path) {
                Ok(bytes) => break bytes,
                Err(e) if is_absent(&e) => {
                    log::debug!(
                        "No state file at {}, starting fresh.",
                        self.path.display()
                    );
                    return Ok(None);
                }
                Err(e) if attempt < self.load_retries => {
                    attempt += 1;
                    log::debug!(
                        "Reading state failed ({}), retry {}/{}",
                        e,
                        attempt,
                        self.load_retries
                    );
                    thread::sleep(self.retry_delay);
                }
                Err(e) => {
                    return Err(AppError::FileRead {
                        path: self.path.clone(),
                        source: e,
                    });
                }
            }
        };

        match serde_json::from_slice::<WatchState>(&bytes) {
            Ok(mut state) => {
                state.last_accessed = Utc::now();
                Ok(Some(state))
            }
            Err(e) => {
                let backup = self.corrupt_backup_path();
                if let Err(copy_err) = fs::write(&backup, &bytes) {
                    log::warn!(
                        "Could not preserve corrupt state at {}: {}",
                        backup.display(),
                        copy_err
                    );
                }
                Err(AppError::StateCorrupt {
                    path: self.path.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Flips the staged flag of every path to the inverse of the first
    /// path's current value, so a multi-selection ends up in one consistent
    /// state. Returns the value applied.
    pub fn toggle_staged(&self, paths: &[String]) -> Result<bool> {
        let Some(first) = paths.first() else {
            log::debug!("toggle_staged called with no paths.");
            return Ok(false);
        };
        self.update(|state| {
            let target = !state
                .files
                .get(&normalize_key(first))
                .is_some_and(|e| e.is_staged);
            for path in paths {
                state.entry_mut(path).is_staged = target;
            }
            log::info!("Set staged={} on {} file(s).", target, paths.len());
            target
        })
    }

    pub fn set_staged(&self, paths: &[String], staged: bool) -> Result<()> {
        self.update(|state| {
            for path in paths {
                state.entry_mut(path).is_staged = staged;
            }
        })
    }

    pub fn add_tag_to_files(&self, tag: &str, paths: &[String]) -> Result<()> {
        let tag = validate_tag(tag)?;
        self.update(|state| {
            let added = paths
                .iter()
                .filter(|path| state.entry_mut(path).tags.insert(tag.to_string()))
                .count();
            log::info!("Tag \"{}\" added to {} file(s).", tag, added);
        })
    }

    pub fn remove_tag_from_files(&self, tag: &str, paths: &[String]) -> Result<()> {
        let tag = validate_tag(tag)?;
        self.update(|state| {
            let mut removed = 0;
            for path in paths {
                if let Some(entry) = state.files.get_mut(&normalize_key(path)) {
                    if entry.tags.shift_remove(tag) {
                        removed += 1;
                    }
                }
            }
            log::info!("Tag \"{}\" removed from {} file(s).", tag, removed);
        })
    }

    /// Strips `tag` from every entry, e.g. after its definition is deleted.
    pub fn remove_tag_everywhere(&self, tag: &str) -> Result<usize> {
        let tag = validate_tag(tag)?;
        self.update(|state| {
            let mut stripped = 0;
            for entry in state.files.values_mut() {
                if entry.tags.shift_remove(tag) {
                    stripped += 1;
                }
            }
            stripped
        })
    }

    /// Removes entries for files that no longer exist and carry no user
    /// metadata. Returns the number of entries removed.
    pub fn prune_missing(&self, live_paths: &HashSet<String>) -> Result<usize> {
        self.update(|state| {
            let before = state.files.len();
            state
                .files
                .retain(|path, entry| live_paths.contains(path) || entry.has_user_metadata());
            let removed = before - state.files.len();
            log::info!("Pruned {} stale state entries.", removed);
            removed
        })
    }

    fn write_state(&self, state: &WatchState) -> Result<()> {
        match storage::write_json_atomic(&self.path, state) {
            Ok(()) => {
                log::trace!("State saved ({} entries).", state.files.len());
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to save state to {}: {}", self.path.display(), e);
                recover_after_failed_write(&self.path);
                Err(e)
            }
        }
    }

    fn corrupt_backup_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".corrupt");
        self.path.with_file_name(name)
    }
}

/// After a failed write, makes sure the document at `path` is at least
/// parseable. An intact previous document is left alone.
fn recover_after_failed_write(path: &Path) {
    let intact = fs::read(path)
        .ok()
        .is_some_and(|c| serde_json::from_slice::<WatchState>(&c).is_ok());
    if intact {
        return;
    }
    match storage::write_json_atomic(path, &WatchState::default()) {
        Ok(()) => log::warn!("Wrote default state to {}", path.display()),
        Err(e) => log::error!("Recovery write of default state failed: {}", e),
    }
}

fn is_absent(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

/// Project-relative, forward-slash key without a leading `./` or `/`.
/// Case is preserved.
pub fn normalize_key(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let mut key = forward.as_str();
    while let Some(rest) = key.strip_prefix("./") {
        key = rest;
    }
    key.trim_start_matches('/').to_string()
}

/// `(directory, name)`; the directory is empty for top-level files.
pub fn split_path(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

pub(crate) fn validate_tag(tag: &str) -> Result<&str> {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidArgument("Tag name must not be empty".to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_normalized_without_case_folding() {
        assert_eq!(normalize_key("./src\\App.ts"), "src/App.ts");
        assert_eq!(normalize_key("/README.md"), "README.md");
    }

    #[test]
    fn entry_for_path_derives_name_and_directory() {
        let entry = FileStateEntry::for_path("src/lib/util.rs");
        assert_eq!(entry.name, "util.rs");
        assert_eq!(entry.directory, "src/lib");
        let top = FileStateEntry::for_path("Cargo.toml");
        assert_eq!(top.directory, "");
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = r#"{"lastAccessed":"2024-01-01T00:00:00Z","files":{"a.ts":{"name":"a.ts","directory":"","isChanged":false,"isStaged":true,"tags":["core"],"pinned":true}},"masterBundle":null}"#;
        let state: WatchState = serde_json::from_str(json).unwrap();
        let entry = &state.files["a.ts"];
        assert!(entry.is_staged);
        assert_eq!(entry.extra.get("pinned"), Some(&serde_json::Value::Bool(true)));
        let out = serde_json::to_string(&state).unwrap();
        assert!(out.contains("\"pinned\":true"));
    }

    #[test]
    fn recovery_replaces_unparseable_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");
        fs::write(&path, "{\"files\": [").unwrap();
        recover_after_failed_write(&path);
        let state: WatchState = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(state.files.is_empty());
    }

    #[test]
    fn recovery_leaves_intact_document_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");
        let intact = r#"{"files":{"a.ts":{"tags":["core"]}}}"#;
        fs::write(&path, intact).unwrap();
        recover_after_failed_write(&path);
        assert_eq!(fs::read_to_string(&path).unwrap(), intact);
    }
}
