//! On-disk layout of a project's xbundle store and the write primitive every
//! persisted artifact goes through.

use crate::error::{AppError, Result};
use log;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const DEFAULT_STORE_DIR: &str = ".xtools/xbundle";
pub const CONFIG_FILENAME: &str = "xbundle.toml";
pub const TAGS_FILENAME: &str = "tags.json";
pub const IGNORE_FILENAME: &str = "pattern-ignore.json";
pub const STATE_FILENAME: &str = "file.json";
pub const MASTER_DIR: &str = "master";
pub const TAG_BUNDLES_DIR: &str = "tag-bundles";
pub const CONTENT_EXTENSION: &str = "txt";
pub const MANIFEST_SUFFIX: &str = "-manifest.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    project_root: PathBuf,
    store_root: PathBuf,
}

impl StorePaths {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            store_root: project_root.join(DEFAULT_STORE_DIR),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }
    pub fn store_root(&self) -> &Path {
        &self.store_root
    }
    pub fn config_dir(&self) -> PathBuf {
        self.store_root.join("config")
    }
    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join(CONFIG_FILENAME)
    }
    pub fn tags_file(&self) -> PathBuf {
        self.config_dir().join(TAGS_FILENAME)
    }
    pub fn ignore_file(&self) -> PathBuf {
        self.config_dir().join(IGNORE_FILENAME)
    }
    pub fn state_file(&self) -> PathBuf {
        self.store_root.join("state").join(STATE_FILENAME)
    }
    pub fn bundles_dir(&self) -> PathBuf {
        self.store_root.join("bundles")
    }
    pub fn master_dir(&self) -> PathBuf {
        self.bundles_dir().join(MASTER_DIR)
    }
    pub fn tag_bundles_dir(&self) -> PathBuf {
        self.bundles_dir().join(TAG_BUNDLES_DIR)
    }
    pub fn tag_dir(&self, tag: &str) -> PathBuf {
        self.tag_bundles_dir().join(slugify(tag))
    }
}

/// Content and manifest paths for bundle `id` inside `dir`.
pub fn artifact_paths(dir: &Path, id: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}.{}", id, CONTENT_EXTENSION)),
        dir.join(format!("{}{}", id, MANIFEST_SUFFIX)),
    )
}

/// Accepts ids made only of ASCII alphanumerics, `-` and `_`, so an id can
/// never name a path outside its bundle directory.
pub fn validate_bundle_id(id: &str) -> Result<&str> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(AppError::InvalidArgument(format!("Invalid bundle id: {:?}", id)))
    }
}

/// Lowercase ASCII alphanumerics with single dashes; never empty.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Writes `content` to a temporary sibling and renames it over `path`, so
/// readers never observe a partially written file.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        AppError::InvalidArgument(format!("Path has no parent: {}", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(|e| AppError::DirCreation {
        path: parent.to_path_buf(),
        source: e,
    })?;
    let persist_err = |source| AppError::PersistWrite {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = NamedTempFile::new_in(parent).map_err(persist_err)?;
    tmp.write_all(content).map_err(persist_err)?;
    tmp.as_file().sync_all().map_err(persist_err)?;
    tmp.persist(path).map_err(|e| persist_err(e.error))?;
    log::trace!("Wrote {} bytes to {}", content.len(), path.display());
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn slugify_produces_path_safe_names() {
        assert_eq!(slugify("Core API"), "core-api");
        assert_eq!(slugify("  --weird//tag!! "), "weird-tag");
        assert_eq!(slugify("???"), "untitled");
    }

    #[test]
    fn bundle_ids_cannot_escape_their_directory() {
        assert!(validate_bundle_id("master-20240101-120000-0a1b2c3d").is_ok());
        assert!(validate_bundle_id("tag-core_api-1").is_ok());
        for id in ["", "../victim", "a/b", "a\\b", "..", "x.txt", "ok id"] {
            assert!(
                matches!(validate_bundle_id(id), Err(AppError::InvalidArgument(_))),
                "{id:?} accepted"
            );
        }
    }

    #[test]
    fn layout_is_rooted_in_store_dir() {
        let paths = StorePaths::new(Path::new("/proj"));
        assert_eq!(
            paths.state_file(),
            Path::new("/proj/.xtools/xbundle/state/file.json")
        );
        assert_eq!(
            paths.tag_dir("Core API"),
            Path::new("/proj/.xtools/xbundle/bundles/tag-bundles/core-api")
        );
        let (content, manifest) = artifact_paths(&paths.master_dir(), "master-1");
        assert!(content.ends_with("bundles/master/master-1.txt"));
        assert!(manifest.ends_with("bundles/master/master-1-manifest.json"));
    }

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c.json");
        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "two");
    }
}
