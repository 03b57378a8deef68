//! Bundle building: resolve a file set from a [`BundleSpec`], render it as an
//! XML document, persist it with its manifest and record the association in
//! the state.

use crate::config::Config;
use crate::document::{self, BundleHeader, DocumentFile, RenderOptions};
use crate::error::{AppError, Result};
use crate::gather::FileRecord;
use crate::pattern::PatternSet;
use crate::state::{MasterBundleRef, WatchState, normalize_key};
use crate::storage::{self, StorePaths};
use chrono::{DateTime, Utc};
use log;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MASTER_ID_PREFIX: &str = "master";
pub const TAG_ID_PREFIX: &str = "tag-";

/// The persisted `type` field of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Master,
    TagDerived,
    Custom,
}

impl BundleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleType::Master => "master",
            BundleType::TagDerived => "tag-derived",
            BundleType::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "master" => Some(BundleType::Master),
            "tag-derived" | "tag" => Some(BundleType::TagDerived),
            "custom" => Some(BundleType::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for BundleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a bundle is, decided when it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleKind {
    Master,
    TagDerived { tag: String },
    Custom,
}

impl BundleKind {
    pub fn bundle_type(&self) -> BundleType {
        match self {
            BundleKind::Master => BundleType::Master,
            BundleKind::TagDerived { .. } => BundleType::TagDerived,
            BundleKind::Custom => BundleType::Custom,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            BundleKind::TagDerived { tag } => Some(tag),
            _ => None,
        }
    }

    /// Directory holding this kind's artifacts.
    pub fn storage_dir(&self, paths: &StorePaths) -> PathBuf {
        match self {
            BundleKind::Master => paths.master_dir(),
            BundleKind::TagDerived { tag } => paths.tag_dir(tag),
            BundleKind::Custom => paths.bundles_dir(),
        }
    }

    fn from_parts(bundle_type: BundleType, tag: Option<&str>) -> Self {
        match (bundle_type, tag) {
            (BundleType::Master, _) => BundleKind::Master,
            (BundleType::TagDerived, Some(tag)) => BundleKind::TagDerived {
                tag: tag.to_string(),
            },
            // A tag bundle that lost its tag can only be treated as custom.
            (BundleType::TagDerived, None) | (BundleType::Custom, _) => BundleKind::Custom,
        }
    }
}

/// Kind of a bundle that predates explicit `type` metadata: an id starting
/// with `master` is the master bundle, a tag back-reference makes it
/// tag-derived, anything else is custom.
pub fn infer_legacy_kind(id: &str, derived_from_tag: Option<&str>) -> BundleKind {
    if id.starts_with(MASTER_ID_PREFIX) {
        BundleKind::Master
    } else if let Some(tag) = derived_from_tag.filter(|t| !t.is_empty()) {
        BundleKind::TagDerived {
            tag: tag.to_string(),
        }
    } else {
        BundleKind::Custom
    }
}

/// A request to build one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSpec {
    /// Whole-project bundle; metadata-carrying files outrank ignore patterns.
    Master { patterns: Vec<String> },
    /// Files matching glob patterns, minus ignored ones.
    Custom { name: String, patterns: Vec<String> },
    /// An explicit file list, typically the staged files.
    Files { name: String, paths: Vec<String> },
    /// Every file currently carrying `tag`.
    Tag { tag: String },
}

impl BundleSpec {
    pub fn kind(&self) -> BundleKind {
        match self {
            BundleSpec::Master { .. } => BundleKind::Master,
            BundleSpec::Tag { tag } => BundleKind::TagDerived { tag: tag.clone() },
            BundleSpec::Custom { .. } | BundleSpec::Files { .. } => BundleKind::Custom,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            BundleSpec::Custom { name, .. } | BundleSpec::Files { name, .. } => Some(name),
            _ => None,
        }
    }

    fn patterns(&self) -> &[String] {
        match self {
            BundleSpec::Master { patterns } | BundleSpec::Custom { patterns, .. } => patterns,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub path: String,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Snapshot of a bundle's files at build time. Never rewritten; a
/// regenerated bundle gets a new id and a new manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub id: String,
    pub created: DateTime<Utc>,
    pub file_count: usize,
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub bundle_type: Option<BundleType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Source patterns of master and pattern-based custom bundles, used to
    /// regenerate them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
}

impl BundleManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| AppError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn kind(&self) -> BundleKind {
        match self.bundle_type {
            Some(bundle_type) => BundleKind::from_parts(bundle_type, self.derived_from_tag.as_deref()),
            None => infer_legacy_kind(&self.id, self.derived_from_tag.as_deref()),
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    /// The [`BundleSpec`] that rebuilds this bundle from current project files.
    pub fn rebuild_spec(&self) -> BundleSpec {
        match self.kind() {
            BundleKind::Master => BundleSpec::Master {
                patterns: if self.patterns.is_empty() {
                    vec![crate::config::DEFAULT_MASTER_PATTERN.to_string()]
                } else {
                    self.patterns.clone()
                },
            },
            BundleKind::TagDerived { tag } => BundleSpec::Tag { tag },
            BundleKind::Custom => {
                let name = self.name.clone().unwrap_or_else(|| self.id.clone());
                if self.patterns.is_empty() {
                    BundleSpec::Files {
                        name,
                        paths: self.paths(),
                    }
                } else {
                    BundleSpec::Custom {
                        name,
                        patterns: self.patterns.clone(),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub project_name: String,
    pub ignore_patterns: Vec<String>,
    pub include_ai_readme: bool,
    pub estimate_tokens: bool,
    pub indent: usize,
    pub description: Option<String>,
}

impl BuildOptions {
    pub fn from_config(config: &Config, project_root: &Path, ignore_patterns: &[String]) -> Self {
        Self {
            project_name: config.get_effective_project_name(project_root),
            ignore_patterns: ignore_patterns.to_vec(),
            include_ai_readme: config.bundle.include_ai_readme,
            estimate_tokens: config.bundle.estimate_tokens,
            indent: config.bundle.indent,
            description: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuiltBundle {
    pub content: String,
    pub manifest: BundleManifest,
}

impl BuiltBundle {
    pub fn kind(&self) -> BundleKind {
        self.manifest.kind()
    }
}

/// Builds bundle content and manifest in memory. Tags always come from
/// `state`, never from the records.
pub fn build(
    spec: &BundleSpec,
    records: &[FileRecord],
    state: &WatchState,
    options: &BuildOptions,
) -> Result<BuiltBundle> {
    let kind = spec.kind();
    let selected = resolve_files(spec, records, state, &options.ignore_patterns)?;
    log::debug!(
        "Resolved {} file(s) for {} bundle.",
        selected.len(),
        kind.bundle_type()
    );

    let created = Utc::now();
    let id = generate_bundle_id(&kind, spec.name(), created);
    let tags: Vec<Vec<String>> = selected.iter().map(|r| state.tags_for(&r.path)).collect();

    let token_estimate = if options.estimate_tokens {
        match document::estimate_tokens(selected.iter().map(|r| r.content.as_str())) {
            Ok(estimate) => estimate,
            Err(e) => {
                log::warn!("Token estimation failed: {}", e);
                None
            }
        }
    } else {
        None
    };

    let description = options.description.clone().or_else(|| {
        kind.tag()
            .map(|tag| format!("Files tagged with \"{}\"", tag))
    });

    let header = BundleHeader {
        id: id.clone(),
        project_name: options.project_name.clone(),
        bundle_type: kind.bundle_type(),
        derived_from_tag: kind.tag().map(str::to_string),
        description: description.clone(),
        created,
        token_estimate,
        ignore_patterns: options.ignore_patterns.clone(),
    };
    let files: Vec<DocumentFile<'_>> = selected
        .iter()
        .zip(&tags)
        .map(|(&record, tags)| DocumentFile { record, tags })
        .collect();
    let content = document::render_bundle_document(
        &header,
        &files,
        &RenderOptions {
            include_ai_readme: options.include_ai_readme,
            indent: options.indent,
        },
    )?;

    let manifest = BundleManifest {
        id,
        created,
        file_count: selected.len(),
        files: selected
            .iter()
            .zip(tags)
            .map(|(record, tags)| ManifestEntry {
                path: record.path.clone(),
                last_modified: record.last_modified,
                tags,
            })
            .collect(),
        bundle_type: Some(kind.bundle_type()),
        derived_from_tag: kind.tag().map(str::to_string),
        description,
        name: spec.name().map(str::to_string),
        patterns: spec.patterns().to_vec(),
    };
    log::info!(
        "Built {} bundle {} with {} file(s).",
        kind.bundle_type(),
        manifest.id,
        manifest.file_count
    );
    Ok(BuiltBundle { content, manifest })
}

fn resolve_files<'a>(
    spec: &BundleSpec,
    records: &'a [FileRecord],
    state: &WatchState,
    ignore_patterns: &[String],
) -> Result<Vec<&'a FileRecord>> {
    let ignore = PatternSet::new(ignore_patterns);
    let has_metadata =
        |path: &str| state.files.get(path).is_some_and(|e| e.has_user_metadata());

    // Dedupe by path; the first record for a path wins.
    let mut by_path: BTreeMap<&str, &FileRecord> = BTreeMap::new();
    for record in records {
        by_path.entry(record.path.as_str()).or_insert(record);
    }

    let selected: Vec<&FileRecord> = match spec {
        BundleSpec::Master { patterns } => {
            let include = PatternSet::new(patterns.as_slice());
            by_path
                .into_values()
                .filter(|r| include.match_file(&r.path).is_some())
                .filter(|r| match ignore.match_file(&r.path) {
                    None => true,
                    Some(pattern) if has_metadata(&r.path) => {
                        log::debug!(
                            "Keeping {} despite ignore pattern '{}': it carries user metadata.",
                            r.path,
                            pattern
                        );
                        true
                    }
                    Some(_) => false,
                })
                .collect()
        }
        BundleSpec::Custom { patterns, .. } => {
            let include = PatternSet::new(patterns.as_slice());
            by_path
                .into_values()
                .filter(|r| include.match_file(&r.path).is_some())
                .filter(|r| !ignore.is_ignored(&r.path, false))
                .collect()
        }
        BundleSpec::Files { name, paths } => {
            if paths.is_empty() {
                return Err(AppError::InvalidArgument(format!(
                    "Bundle '{}' has no files to include",
                    name
                )));
            }
            let wanted: HashSet<String> = paths.iter().map(|p| normalize_key(p)).collect();
            let found: Vec<&FileRecord> = by_path
                .into_values()
                .filter(|r| wanted.contains(&r.path))
                .collect();
            if found.len() < wanted.len() {
                log::warn!(
                    "{} of {} requested file(s) for bundle '{}' are not available.",
                    wanted.len() - found.len(),
                    wanted.len(),
                    name
                );
            }
            found
        }
        BundleSpec::Tag { tag } => {
            let found: Vec<&FileRecord> = by_path
                .into_values()
                .filter(|r| state.files.get(&r.path).is_some_and(|e| e.tags.contains(tag)))
                .collect();
            if found.is_empty() {
                return Err(AppError::EmptyTagBundle { tag: tag.clone() });
            }
            found
        }
    };
    Ok(selected)
}

/// `{prefix}-{YYYYmmdd-HHMMSS}-{8 hex}`. The prefix identifies the kind so
/// that even a manifest-less bundle can be classified.
pub fn generate_bundle_id(kind: &BundleKind, name: Option<&str>, created: DateTime<Utc>) -> String {
    let prefix = match kind {
        BundleKind::Master => MASTER_ID_PREFIX.to_string(),
        BundleKind::TagDerived { tag } => format!("{}{}", TAG_ID_PREFIX, storage::slugify(tag)),
        BundleKind::Custom => {
            let slug = storage::slugify(name.unwrap_or("custom"));
            if slug.starts_with(MASTER_ID_PREFIX) {
                format!("custom-{}", slug)
            } else {
                slug
            }
        }
    };
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        prefix,
        created.format("%Y%m%d-%H%M%S"),
        &suffix[..8]
    )
}

/// Writes content and manifest next to each other. A manifest write failure
/// removes the already written content so no half bundle is listed.
pub fn persist(paths: &StorePaths, built: &BuiltBundle) -> Result<(PathBuf, PathBuf)> {
    let dir = built.kind().storage_dir(paths);
    let (content_path, manifest_path) = storage::artifact_paths(&dir, &built.manifest.id);

    storage::write_atomic(&content_path, built.content.as_bytes())?;
    if let Err(e) = storage::write_json_atomic(&manifest_path, &built.manifest) {
        log::error!(
            "Manifest write failed for bundle {}; removing its content.",
            built.manifest.id
        );
        if let Err(cleanup) = fs::remove_file(&content_path) {
            log::warn!(
                "Could not remove {}: {}",
                content_path.display(),
                cleanup
            );
        }
        return Err(e);
    }
    log::info!("Persisted bundle {} to {}", built.manifest.id, dir.display());
    Ok((content_path, manifest_path))
}

/// Records a freshly built bundle in the state. Tag-derived bundles are
/// snapshots and leave the state untouched.
pub fn apply_to_state(state: &mut WatchState, manifest: &BundleManifest) {
    let kind = manifest.kind();
    if matches!(kind, BundleKind::TagDerived { .. }) {
        return;
    }
    for file in &manifest.files {
        let entry = state.entry_mut(&file.path);
        entry.is_staged = false;
        entry.last_modified = Some(file.last_modified);
        entry.is_changed = false;
        match kind {
            BundleKind::Master => entry.master_bundle_id = Some(manifest.id.clone()),
            _ => {
                if !entry.bundle_ids.contains(&manifest.id) {
                    entry.bundle_ids.push(manifest.id.clone());
                }
            }
        }
    }
    if kind == BundleKind::Master {
        state.master_bundle = Some(MasterBundleRef {
            id: manifest.id.clone(),
            created: manifest.created,
            file_count: manifest.file_count,
        });
    }
}

/// Drops every state reference to bundle `id`.
pub fn detach_from_state(state: &mut WatchState, id: &str) -> usize {
    let mut touched = 0;
    for entry in state.files.values_mut() {
        let before = entry.bundle_ids.len();
        entry.bundle_ids.retain(|b| b != id);
        let mut changed = entry.bundle_ids.len() != before;
        if entry.master_bundle_id.as_deref() == Some(id) {
            entry.master_bundle_id = None;
            changed = true;
        }
        if changed {
            touched += 1;
        }
    }
    if state.master_bundle.as_ref().is_some_and(|m| m.id == id) {
        state.master_bundle = None;
    }
    touched
}

/// Removes a bundle's content and manifest from `dir`. Already absent
/// artifacts are not an error; an emptied tag directory is removed too.
pub fn remove_artifacts(dir: &Path, id: &str) -> Result<()> {
    let id = storage::validate_bundle_id(id)?;
    let (content_path, manifest_path) = storage::artifact_paths(dir, id);
    for path in [&content_path, &manifest_path] {
        match fs::remove_file(path) {
            Ok(()) => log::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AppError::PersistWrite {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }
    let is_tag_dir = dir
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|n| n == storage::TAG_BUNDLES_DIR);
    if is_tag_dir && fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none()) {
        if let Err(e) = fs::remove_dir(dir) {
            log::debug!("Leaving tag directory {}: {}", dir.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileStateEntry;

    fn record(path: &str) -> FileRecord {
        FileRecord::new(path, Utc::now(), 4, format!("// {}", path))
    }

    fn options(ignore: &[&str]) -> BuildOptions {
        BuildOptions {
            project_name: "demo".to_string(),
            ignore_patterns: ignore.iter().map(|s| s.to_string()).collect(),
            include_ai_readme: false,
            estimate_tokens: false,
            indent: 0,
            description: None,
        }
    }

    fn state_with_tag(path: &str, tag: &str) -> WatchState {
        let mut state = WatchState::default();
        state.entry_mut(path).tags.insert(tag.to_string());
        state
    }

    #[test]
    fn master_keeps_ignored_files_that_carry_metadata() {
        let records = vec![record("a.ts"), record("README.md"), record("NOTES.md")];
        let state = state_with_tag("README.md", "core");
        let spec = BundleSpec::Master {
            patterns: vec!["**/*".to_string()],
        };
        let built = build(&spec, &records, &state, &options(&["*.md"])).unwrap();
        assert_eq!(built.manifest.paths(), vec!["README.md", "a.ts"]);
        assert_eq!(built.manifest.entry("README.md").unwrap().tags, vec!["core"]);
        assert_eq!(built.manifest.bundle_type, Some(BundleType::Master));
    }

    #[test]
    fn custom_patterns_respect_ignores_without_override() {
        let records = vec![record("src/a.ts"), record("src/b.md")];
        let state = state_with_tag("src/b.md", "docs");
        let spec = BundleSpec::Custom {
            name: "Sources".to_string(),
            patterns: vec!["src/**".to_string()],
        };
        let built = build(&spec, &records, &state, &options(&["*.md"])).unwrap();
        assert_eq!(built.manifest.paths(), vec!["src/a.ts"]);
        assert!(built.manifest.id.starts_with("sources-"));
    }

    #[test]
    fn tags_come_from_state_not_records() {
        let mut stale = record("a.ts");
        stale.tags = vec!["old".to_string()];
        let state = state_with_tag("a.ts", "core");
        let built = build(
            &BundleSpec::Tag {
                tag: "core".to_string(),
            },
            &[stale],
            &state,
            &options(&[]),
        )
        .unwrap();
        assert_eq!(built.manifest.files[0].tags, vec!["core"]);
        assert_eq!(built.manifest.derived_from_tag.as_deref(), Some("core"));
        assert_eq!(
            built.manifest.description.as_deref(),
            Some("Files tagged with \"core\"")
        );
        assert!(built.content.contains("<tags>core</tags>"));
    }

    #[test]
    fn empty_tag_bundle_is_an_error() {
        let err = build(
            &BundleSpec::Tag {
                tag: "nothing".to_string(),
            },
            &[record("a.ts")],
            &WatchState::default(),
            &options(&[]),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::EmptyTagBundle { tag } if tag == "nothing"));
    }

    #[test]
    fn ids_encode_kind_and_are_unique() {
        let now = Utc::now();
        let a = generate_bundle_id(&BundleKind::Master, None, now);
        let b = generate_bundle_id(&BundleKind::Master, None, now);
        assert!(a.starts_with("master-"));
        assert_ne!(a, b);
        let tag = generate_bundle_id(
            &BundleKind::TagDerived {
                tag: "Core API".to_string(),
            },
            None,
            now,
        );
        assert!(tag.starts_with("tag-core-api-"));
        let custom = generate_bundle_id(&BundleKind::Custom, Some("Master plan"), now);
        assert!(custom.starts_with("custom-master-plan-"));
        assert_eq!(infer_legacy_kind(&custom, None), BundleKind::Custom);
    }

    #[test]
    fn state_updates_depend_on_kind() {
        let mut state = WatchState::default();
        state.files.insert(
            "a.ts".to_string(),
            FileStateEntry {
                is_staged: true,
                ..FileStateEntry::for_path("a.ts")
            },
        );
        state.entry_mut("a.ts").tags.insert("core".to_string());

        let master = build(
            &BundleSpec::Master {
                patterns: vec!["**/*".to_string()],
            },
            &[record("a.ts")],
            &state,
            &options(&[]),
        )
        .unwrap();
        apply_to_state(&mut state, &master.manifest);
        let entry = &state.files["a.ts"];
        assert!(!entry.is_staged);
        assert_eq!(entry.master_bundle_id.as_deref(), Some(master.manifest.id.as_str()));
        assert!(entry.tags.contains("core"));
        assert_eq!(state.master_bundle.as_ref().unwrap().file_count, 1);

        let before = state.clone();
        let tag = build(
            &BundleSpec::Tag {
                tag: "core".to_string(),
            },
            &[record("a.ts")],
            &state,
            &options(&[]),
        )
        .unwrap();
        apply_to_state(&mut state, &tag.manifest);
        assert_eq!(state, before);

        assert_eq!(detach_from_state(&mut state, &master.manifest.id), 1);
        assert!(state.master_bundle.is_none());
        assert!(state.files["a.ts"].master_bundle_id.is_none());
    }

    #[test]
    fn legacy_manifest_kind_is_inferred() {
        let json = r#"{"id":"tag-bundle-1","created":"2024-01-01T00:00:00Z","fileCount":0,"files":[],"derivedFromTag":"core"}"#;
        let manifest: BundleManifest = serde_json::from_str(json).unwrap();
        assert_eq!(
            manifest.kind(),
            BundleKind::TagDerived {
                tag: "core".to_string()
            }
        );
        assert_eq!(
            manifest.rebuild_spec(),
            BundleSpec::Tag {
                tag: "core".to_string()
            }
        );
    }
}
