//! Read-only reconstruction of the bundle list from persisted artifacts.

use crate::bundle::{BundleKind, BundleManifest, BundleType, infer_legacy_kind};
use crate::document::{self, ParsedBundle};
use crate::error::{AppError, Result};
use crate::state::WatchState;
use crate::storage::{self, StorePaths};
use chrono::{DateTime, Utc};
use log;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Display view of one persisted bundle. The manifest stays the source of
/// truth; this is rebuilt on every listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub name: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub file_count: usize,
    pub tag_count: usize,
    #[serde(rename = "type")]
    pub bundle_type: BundleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derived_from_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip)]
    pub dir: PathBuf,
    #[serde(skip)]
    pub has_manifest: bool,
}

impl Bundle {
    pub fn kind(&self) -> BundleKind {
        match (self.bundle_type, &self.derived_from_tag) {
            (BundleType::Master, _) => BundleKind::Master,
            (BundleType::TagDerived, Some(tag)) => BundleKind::TagDerived { tag: tag.clone() },
            _ => BundleKind::Custom,
        }
    }
}

/// Every bundle under the store, newest first, with only the most recent
/// master bundle kept. Unparsable bundles are logged and skipped.
pub fn list_bundles(paths: &StorePaths, state: &WatchState) -> Vec<Bundle> {
    if !paths.bundles_dir().is_dir() {
        return Vec::new();
    }
    let mut bundles: Vec<Bundle> = content_files(paths)
        .filter_map(|entry| match describe(entry.path(), state) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                log::error!("Skipping bundle {}: {}", entry.path().display(), e);
                None
            }
        })
        .collect();

    bundles.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
    let mut seen_master = false;
    bundles.retain(|b| {
        if b.bundle_type != BundleType::Master {
            return true;
        }
        if seen_master {
            log::debug!("Older master bundle {} not listed.", b.id);
            return false;
        }
        seen_master = true;
        true
    });
    log::debug!("Listed {} bundle(s).", bundles.len());
    bundles
}

pub fn find_bundle(paths: &StorePaths, state: &WatchState, id: &str) -> Result<Bundle> {
    let dir = locate(paths, id)?;
    let (content_path, _) = storage::artifact_paths(&dir, id);
    describe(&content_path, state)
}

/// Directory holding bundle `id`'s artifacts. Fails with `BundleNotFound`
/// when neither artifact exists and `InvalidArgument` for a malformed id.
pub fn locate(paths: &StorePaths, id: &str) -> Result<PathBuf> {
    let id = storage::validate_bundle_id(id)?;
    let mut candidates = vec![paths.bundles_dir(), paths.master_dir()];
    if let Ok(entries) = fs::read_dir(paths.tag_bundles_dir()) {
        candidates.extend(
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir()),
        );
    }
    candidates
        .into_iter()
        .find(|dir| {
            let (content, manifest) = storage::artifact_paths(dir, id);
            content.is_file() || manifest.is_file()
        })
        .ok_or_else(|| AppError::BundleNotFound(id.to_string()))
}

/// The manifest of bundle `id`.
pub fn load_manifest(paths: &StorePaths, id: &str) -> Result<BundleManifest> {
    let dir = locate(paths, id)?;
    let (_, manifest_path) = storage::artifact_paths(&dir, id);
    if !manifest_path.is_file() {
        return Err(AppError::MissingManifest {
            bundle_id: id.to_string(),
        });
    }
    BundleManifest::load(&manifest_path)
}

/// Content files at the three well-known locations: `bundles/<id>.txt`,
/// `bundles/master/<id>.txt` and `bundles/tag-bundles/<tag>/<id>.txt`.
fn content_files(paths: &StorePaths) -> impl Iterator<Item = DirEntry> {
    let bundles_dir = paths.bundles_dir();
    WalkDir::new(&bundles_dir)
        .min_depth(1)
        .max_depth(3)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Error scanning bundles: {}", AppError::from(e));
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_content_location(entry))
}

fn is_content_location(entry: &DirEntry) -> bool {
    let is_content = entry
        .path()
        .extension()
        .is_some_and(|ext| ext == storage::CONTENT_EXTENSION);
    if !is_content {
        return false;
    }
    let ancestor_name = |n: usize| {
        entry
            .path()
            .ancestors()
            .nth(n)
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
    };
    match entry.depth() {
        1 => true,
        2 => ancestor_name(1).as_deref() == Some(storage::MASTER_DIR),
        3 => ancestor_name(2).as_deref() == Some(storage::TAG_BUNDLES_DIR),
        _ => false,
    }
}

fn describe(content_path: &Path, state: &WatchState) -> Result<Bundle> {
    let id = content_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::InvalidArgument(format!("Not a bundle file: {}", content_path.display())))?;
    let dir = content_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let content = fs::read_to_string(content_path).map_err(|e| AppError::FileRead {
        path: content_path.to_path_buf(),
        source: e,
    })?;
    let parsed = document::parse_bundle_document(&content)?;

    let (_, manifest_path) = storage::artifact_paths(&dir, &id);
    let manifest = if manifest_path.is_file() {
        Some(BundleManifest::load(&manifest_path)?)
    } else {
        log::warn!("Bundle {} has no manifest; tag count unavailable.", id);
        None
    };

    let kind = resolve_kind(&id, &dir, manifest.as_ref(), &parsed);
    let derived_from_tag = kind.tag().map(str::to_string);
    let description = manifest
        .as_ref()
        .and_then(|m| m.description.clone())
        .or_else(|| parsed.description.clone())
        .or_else(|| {
            derived_from_tag
                .as_ref()
                .map(|tag| format!("Files tagged with \"{}\"", tag))
        });

    let timestamp = match manifest.as_ref().map(|m| m.created).or(parsed.created) {
        Some(ts) => ts,
        None => fs::metadata(content_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .map_err(AppError::Io)?,
    };

    let tag_count = manifest.as_ref().map_or(0, |m| {
        m.files
            .iter()
            .filter(|f| state.files.get(&f.path).is_some_and(|e| !e.tags.is_empty()))
            .count()
    });

    Ok(Bundle {
        name: manifest
            .as_ref()
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| id.clone()),
        id,
        timestamp,
        file_count: parsed.document_count,
        tag_count,
        bundle_type: kind.bundle_type(),
        derived_from_tag,
        description,
        dir,
        has_manifest: manifest.is_some(),
    })
}

/// Explicit manifest type first, then the document header, then legacy
/// inference from the id and storage location.
fn resolve_kind(
    id: &str,
    dir: &Path,
    manifest: Option<&BundleManifest>,
    parsed: &ParsedBundle,
) -> BundleKind {
    if let Some(manifest) = manifest.filter(|m| m.bundle_type.is_some()) {
        return manifest.kind();
    }
    let tag = manifest
        .and_then(|m| m.derived_from_tag.clone())
        .or_else(|| parsed.derived_from_tag.clone());
    if let Some(bundle_type) = parsed.bundle_type.as_deref().and_then(BundleType::parse) {
        return match (bundle_type, tag) {
            (BundleType::Master, _) => BundleKind::Master,
            (BundleType::TagDerived, Some(tag)) => BundleKind::TagDerived { tag },
            _ => BundleKind::Custom,
        };
    }

    let parent_name = dir.file_name().map(|n| n.to_string_lossy().into_owned());
    let grandparent_name = dir
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned());
    if parent_name.as_deref() == Some(storage::MASTER_DIR) {
        return BundleKind::Master;
    }
    let tag = tag.or_else(|| {
        parent_name.filter(|_| grandparent_name.as_deref() == Some(storage::TAG_BUNDLES_DIR))
    });
    infer_legacy_kind(id, tag.as_deref())
}
