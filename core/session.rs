//! The caller-owned handle on one project's store. Every operation reads
//! and writes through it; nothing is cached globally.

use crate::builtin::get_builtin_ignore_patterns;
use crate::bundle::{self, BuildOptions, BundleKind, BundleManifest, BundleSpec};
use crate::config::{self, Config};
use crate::error::{AppError, Result};
use crate::gather::{self, EnumerateOptions, FileRecord};
use crate::pattern::PatternSet;
use crate::registry::{self, Bundle};
use crate::staleness::{self, StalenessReport};
use crate::state::{StateStore, WatchState, normalize_key};
use crate::storage::StorePaths;
use crate::tags::{self, TagDefinition, TagDefinitions};
use log;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ProjectSession {
    paths: StorePaths,
    config: Config,
    ignore_patterns: Vec<String>,
    tags: TagDefinitions,
    store: StateStore,
}

impl ProjectSession {
    /// Opens the store of the project at `project_root`. Missing or broken
    /// config files fall back to defaults.
    pub fn open(project_root: &Path) -> Self {
        let paths = StorePaths::new(project_root);
        let config = Config::load_or_default(&paths);
        Self::with_config(paths, config)
    }

    /// Resolves the project root the way the tool's entry points do
    /// (explicit path, then `PROJECT_ROOT`, then the current directory).
    pub fn discover(project_root: Option<&PathBuf>) -> Result<Self> {
        let root = Config::determine_project_root(project_root)?;
        log::info!("Using project root: {}", root.display());
        Ok(Self::open(&root))
    }

    pub fn with_config(paths: StorePaths, config: Config) -> Self {
        let ignore_patterns = config::load_ignore_patterns(&paths.ignore_file());
        let tags = tags::load_tag_definitions(&paths.tags_file());
        let store = StateStore::from_config(&paths, &config);
        log::debug!(
            "Session opened for {} ({} ignore patterns, {} tags).",
            paths.project_root().display(),
            ignore_patterns.len(),
            tags.len()
        );
        Self {
            paths,
            config,
            ignore_patterns,
            tags,
            store,
        }
    }

    pub fn project_root(&self) -> &Path {
        self.paths.project_root()
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }

    pub fn load_state(&self) -> WatchState {
        self.store.load()
    }

    pub fn ignore_patterns(&self) -> &[String] {
        &self.ignore_patterns
    }

    /// Replaces and persists the ignore list. File state is not touched.
    pub fn set_ignore_patterns(&mut self, patterns: Vec<String>) -> Result<()> {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        config::save_ignore_patterns(&self.paths.ignore_file(), &patterns)?;
        log::info!("Ignore patterns updated ({} patterns).", patterns.len());
        self.ignore_patterns = patterns;
        Ok(())
    }

    /// Enumerates the project, merges persisted metadata into the records
    /// and records the refreshed file facts in the state.
    pub fn refresh_files(&self) -> Result<Vec<FileRecord>> {
        let mut records = self.enumerate();
        let master = self.master_manifest();
        let state = self.store.load();

        for record in &mut records {
            if let Some(entry) = state.files.get(&record.path) {
                record.is_staged = entry.is_staged;
                record.tags = entry.tags.iter().cloned().collect();
                record.master_bundle_id = entry.master_bundle_id.clone();
            }
            record.is_changed = master
                .as_ref()
                .and_then(|m| m.entry(&record.path))
                .is_none_or(|e| record.last_modified > e.last_modified);
        }

        self.store.update(|state| {
            for record in &records {
                let entry = state.entry_mut(&record.path);
                entry.name = record.name.clone();
                entry.directory = record.directory.clone();
                entry.last_modified = Some(record.last_modified);
                entry.is_changed = record.is_changed;
            }
        })?;
        log::info!("Refreshed {} file(s).", records.len());
        Ok(records)
    }

    pub fn toggle_staged(&self, paths: &[String]) -> Result<bool> {
        self.store.toggle_staged(paths)
    }

    pub fn set_staged(&self, paths: &[String], staged: bool) -> Result<()> {
        self.store.set_staged(paths, staged)
    }

    /// Tags `paths`, registering a definition with default attributes when
    /// the tag is new.
    pub fn add_tag(&mut self, tag: &str, paths: &[String]) -> Result<()> {
        self.store.add_tag_to_files(tag, paths)?;
        let name = tag.trim();
        if !self.tags.contains_key(name) {
            self.upsert_tag(name, None, None)?;
        }
        Ok(())
    }

    pub fn remove_tag(&self, tag: &str, paths: &[String]) -> Result<()> {
        self.store.remove_tag_from_files(tag, paths)
    }

    pub fn list_tags(&self) -> &TagDefinitions {
        &self.tags
    }

    /// Creates or edits a tag definition. `None` keeps the existing value
    /// (or the default for a new tag).
    pub fn upsert_tag(
        &mut self,
        name: &str,
        color: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidArgument(
                "Tag name must not be empty".to_string(),
            ));
        }
        let mut definition = self
            .tags
            .get(name)
            .cloned()
            .unwrap_or_else(|| TagDefinition::new(name, None, None));
        if let Some(color) = color {
            definition.color = color.to_string();
        }
        if let Some(description) = description {
            definition.description = description.to_string();
        }
        let mut updated = self.tags.clone();
        updated.insert(name.to_string(), definition);
        tags::save_tag_definitions(&self.paths.tags_file(), &updated)?;
        self.tags = updated;
        Ok(())
    }

    /// Deletes a tag definition and strips the tag from every file.
    /// Returns the number of files that lost the tag.
    pub fn delete_tag(&mut self, name: &str) -> Result<usize> {
        let name = name.trim();
        let mut updated = self.tags.clone();
        if updated.shift_remove(name).is_some() {
            tags::save_tag_definitions(&self.paths.tags_file(), &updated)?;
            self.tags = updated;
        }
        let stripped = self.store.remove_tag_everywhere(name)?;
        log::info!("Tag \"{}\" deleted; removed from {} file(s).", name, stripped);
        Ok(stripped)
    }

    pub fn create_master_bundle(&self) -> Result<BundleManifest> {
        self.create_bundle(&BundleSpec::Master {
            patterns: self.config.bundle.master_patterns.clone(),
        })
    }

    pub fn create_tag_bundle(&self, tag: &str) -> Result<BundleManifest> {
        self.create_bundle(&BundleSpec::Tag {
            tag: tag.trim().to_string(),
        })
    }

    pub fn create_custom_bundle(&self, name: &str, patterns: &[String]) -> Result<BundleManifest> {
        self.create_bundle(&BundleSpec::Custom {
            name: name.to_string(),
            patterns: patterns.to_vec(),
        })
    }

    /// Custom bundle of the currently staged files; staging is cleared on
    /// success.
    pub fn create_staged_bundle(&self, name: &str) -> Result<BundleManifest> {
        let staged = self.store.load().staged_paths();
        if staged.is_empty() {
            return Err(AppError::InvalidArgument("No files are staged".to_string()));
        }
        self.create_bundle(&BundleSpec::Files {
            name: name.to_string(),
            paths: staged,
        })
    }

    /// Builds, persists and records a bundle. Nothing is written unless the
    /// build succeeds.
    pub fn create_bundle(&self, spec: &BundleSpec) -> Result<BundleManifest> {
        self.create_bundle_with(spec, None)
    }

    fn create_bundle_with(
        &self,
        spec: &BundleSpec,
        description: Option<String>,
    ) -> Result<BundleManifest> {
        let built = self.build(spec, description)?;
        self.commit(built)
    }

    fn build(&self, spec: &BundleSpec, description: Option<String>) -> Result<bundle::BuiltBundle> {
        let state = self.store.load();
        let records = self.records_for(spec, &state);
        let mut options =
            BuildOptions::from_config(&self.config, self.project_root(), &self.ignore_patterns);
        options.description = description;
        bundle::build(spec, &records, &state, &options)
    }

    /// Persists the artifacts, then records them in the state. If the state
    /// cannot be updated the artifacts are removed again.
    fn commit(&self, built: bundle::BuiltBundle) -> Result<BundleManifest> {
        bundle::persist(&self.paths, &built)?;
        if !matches!(built.kind(), BundleKind::TagDerived { .. }) {
            let recorded = self
                .store
                .update(|state| bundle::apply_to_state(state, &built.manifest));
            if let Err(e) = recorded {
                log::error!("Recording bundle {} failed: {}", built.manifest.id, e);
                let dir = built.kind().storage_dir(&self.paths);
                if let Err(cleanup) = bundle::remove_artifacts(&dir, &built.manifest.id) {
                    log::warn!("Could not remove bundle {}: {}", built.manifest.id, cleanup);
                }
                return Err(e);
            }
        }
        Ok(built.manifest)
    }

    /// Enumerated files plus, for the kinds that may reach past the ignore
    /// patterns, the metadata-carrying or explicitly requested files the
    /// walk skipped.
    fn records_for(&self, spec: &BundleSpec, state: &WatchState) -> Vec<FileRecord> {
        let mut records = self.enumerate();
        let wanted: Vec<String> = match spec {
            BundleSpec::Master { .. } => state
                .files
                .iter()
                .filter(|(_, e)| e.has_user_metadata())
                .map(|(p, _)| p.clone())
                .collect(),
            BundleSpec::Files { paths, .. } => paths.iter().map(|p| normalize_key(p)).collect(),
            BundleSpec::Tag { tag } => state.paths_with_tag(tag),
            BundleSpec::Custom { .. } => Vec::new(),
        };

        let known: HashSet<String> = records.iter().map(|r| r.path.clone()).collect();
        let builtin = get_builtin_ignore_patterns();
        let extras: Vec<FileRecord> = wanted
            .iter()
            .filter(|p| !known.contains(*p) && !builtin.is_ignored(p, false))
            .filter_map(|p| gather::read_file_record(self.project_root(), p))
            .collect();
        if !extras.is_empty() {
            log::debug!(
                "Loaded {} file(s) outside the enumerated set for this bundle.",
                extras.len()
            );
        }
        records.extend(extras);
        records
    }

    fn enumerate(&self) -> Vec<FileRecord> {
        gather::enumerate_with(
            self.project_root(),
            &PatternSet::new(self.ignore_patterns.as_slice()),
            EnumerateOptions {
                use_gitignore: self.config.general.use_gitignore,
            },
        )
    }

    pub fn list_bundles(&self) -> Vec<Bundle> {
        registry::list_bundles(&self.paths, &self.store.load())
    }

    pub fn find_bundle(&self, id: &str) -> Result<Bundle> {
        registry::find_bundle(&self.paths, &self.store.load(), id)
    }

    /// Manifest of the master bundle recorded in the state, if readable.
    pub fn master_manifest(&self) -> Option<BundleManifest> {
        let id = self.store.load().master_bundle?.id;
        match registry::load_manifest(&self.paths, &id) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                log::warn!("Master bundle {} unavailable: {}", id, e);
                None
            }
        }
    }

    /// Staleness of bundle `id` against the files on disk now. A bundle
    /// without a manifest yields an empty report with a note.
    pub fn bundle_health(&self, id: &str) -> Result<StalenessReport> {
        let manifest = match registry::load_manifest(&self.paths, id) {
            Ok(manifest) => manifest,
            Err(AppError::MissingManifest { bundle_id }) => {
                log::info!("Bundle {} has no manifest; health unavailable.", bundle_id);
                return Ok(staleness::analyze(None, &[]));
            }
            Err(e) => return Err(e),
        };
        let state = self.store.load();
        let mut live = gather::stat_paths(self.project_root(), &manifest.paths());
        for record in &mut live {
            record.tags = state.tags_for(&record.path);
        }
        Ok(staleness::analyze(Some(&manifest), &live))
    }

    /// Removes a bundle's artifacts and every state reference to it.
    pub fn delete_bundle(&self, id: &str) -> Result<()> {
        let dir = registry::locate(&self.paths, id)?;
        bundle::remove_artifacts(&dir, id)?;
        let detached = self
            .store
            .update(|state| bundle::detach_from_state(state, id))?;
        log::info!("Deleted bundle {} ({} file entries detached).", id, detached);
        Ok(())
    }

    /// Rebuilds bundle `id` from its recorded source under a new id. The
    /// old bundle is only removed once the new one has been built.
    pub fn regenerate_bundle(&self, id: &str) -> Result<BundleManifest> {
        let (spec, description) = match registry::load_manifest(&self.paths, id) {
            Ok(manifest) => {
                let description = match manifest.kind() {
                    BundleKind::Custom => manifest.description.clone(),
                    _ => None,
                };
                (manifest.rebuild_spec(), description)
            }
            Err(AppError::MissingManifest { .. }) => {
                let spec = match self.find_bundle(id)?.kind() {
                    BundleKind::Master => BundleSpec::Master {
                        patterns: self.config.bundle.master_patterns.clone(),
                    },
                    BundleKind::TagDerived { tag } => BundleSpec::Tag { tag },
                    BundleKind::Custom => {
                        return Err(AppError::MissingManifest {
                            bundle_id: id.to_string(),
                        });
                    }
                };
                (spec, None)
            }
            Err(e) => return Err(e),
        };

        let built = self.build(&spec, description)?;
        self.delete_bundle(id)?;
        let manifest = self.commit(built)?;
        log::info!("Regenerated bundle {} as {}.", id, manifest.id);
        Ok(manifest)
    }

    /// Drops state entries of deleted files that carry no user metadata.
    pub fn prune_state(&self) -> Result<usize> {
        let state = self.store.load();
        let live: HashSet<String> = state
            .files
            .keys()
            .filter(|p| self.project_root().join(p).is_file())
            .cloned()
            .collect();
        self.store.prune_missing(&live)
    }
}
