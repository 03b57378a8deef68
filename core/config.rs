use crate::builtin::get_default_ignore_patterns;
use crate::error::{AppError, Result};
use crate::storage::{self, StorePaths};
use log;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MASTER_PATTERN: &str = "**/*";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default = "default_false")]
    pub use_gitignore: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default = "default_load_retries")]
    pub load_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BundleConfig {
    #[serde(default = "default_master_patterns")]
    pub master_patterns: Vec<String>,
    #[serde(default = "default_false")]
    pub estimate_tokens: bool,
    #[serde(default = "default_true")]
    pub include_ai_readme: bool,
    #[serde(default = "default_indent")]
    pub indent: usize,
}

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_load_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    50
}
fn default_master_patterns() -> Vec<String> {
    vec![DEFAULT_MASTER_PATTERN.to_string()]
}
fn default_indent() -> usize {
    2
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: None,
            use_gitignore: default_false(),
        }
    }
}
impl Default for StateConfig {
    fn default() -> Self {
        Self {
            load_retries: default_load_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}
impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            master_patterns: default_master_patterns(),
            estimate_tokens: default_false(),
            include_ai_readme: default_true(),
            indent: default_indent(),
        }
    }
}

impl Config {
    pub fn determine_project_root(cli_project_root: Option<&PathBuf>) -> Result<PathBuf> {
        let path_str_opt = cli_project_root
            .map(|p| p.to_string_lossy().to_string())
            .or_else(|| env::var("PROJECT_ROOT").ok().filter(|s| !s.is_empty()));

        let path_to_resolve = match path_str_opt {
            Some(p_str) => PathBuf::from(shellexpand::tilde(&p_str).as_ref()),
            None => env::current_dir().map_err(AppError::Io)?,
        };

        path_to_resolve.canonicalize().map_err(|e| {
            AppError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to canonicalize project root '{}': {}",
                    path_to_resolve.display(),
                    e
                ),
            ))
        })
    }

    pub fn load_from_path(config_path: &Path) -> Result<Self> {
        log::info!("Loading configuration from: {}", config_path.display());
        let toml_content = fs::read_to_string(config_path).map_err(|e| AppError::FileRead {
            path: config_path.to_path_buf(),
            source: e,
        })?;
        toml::from_str::<Config>(&toml_content).map_err(|e| AppError::ConfigParse {
            path: config_path.to_path_buf(),
            message: format!("{}. Check TOML syntax and structure.", e),
        })
    }

    /// Loads the project's `xbundle.toml`; a missing or malformed file
    /// yields the defaults.
    pub fn load_or_default(paths: &StorePaths) -> Self {
        let config_path = paths.config_file();
        if !config_path.exists() {
            log::debug!(
                "No config file at {}, using defaults.",
                config_path.display()
            );
            return Self::default();
        }
        match Self::load_from_path(&config_path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{}; falling back to default configuration.", e);
                Self::default()
            }
        }
    }

    pub fn get_state_retry_delay(&self) -> Duration {
        Duration::from_millis(self.state.retry_delay_ms)
    }

    pub fn get_effective_project_name(&self, project_root: &Path) -> String {
        self.general.project_name.clone().unwrap_or_else(|| {
            project_root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "UnknownProject".to_string())
        })
    }
}

/// Reads the ordered ignore pattern list. A missing file yields the built-in
/// defaults; a malformed one is logged and also yields the defaults.
pub fn load_ignore_patterns(path: &Path) -> Vec<String> {
    let defaults = || get_default_ignore_patterns().to_vec();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!(
                "No ignore pattern file at {}, using defaults.",
                path.display()
            );
            return defaults();
        }
        Err(e) => {
            log::warn!(
                "Failed to read ignore patterns from {}: {}. Using defaults.",
                path.display(),
                e
            );
            return defaults();
        }
    };
    match serde_json::from_str::<Vec<String>>(&content) {
        Ok(patterns) => patterns
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Err(e) => {
            let err = AppError::ConfigParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            };
            log::warn!("{}. Using default ignore patterns.", err);
            defaults()
        }
    }
}

pub fn save_ignore_patterns(path: &Path, patterns: &[String]) -> Result<()> {
    log::debug!("Saving {} ignore patterns to {}", patterns.len(), path.display());
    storage::write_json_atomic(path, &patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str("[bundle]\nestimate_tokens = true\n").unwrap();
        assert!(config.bundle.estimate_tokens);
        assert_eq!(config.bundle.master_patterns, vec!["**/*".to_string()]);
        assert_eq!(config.state.load_retries, 3);
        assert!(!config.general.use_gitignore);
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        storage::write_atomic(&paths.config_file(), b"[general\nbroken").unwrap();
        assert_eq!(Config::load_or_default(&paths), Config::default());
    }

    #[test]
    fn ignore_patterns_round_trip_and_fallback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pattern-ignore.json");
        assert_eq!(load_ignore_patterns(&path), get_default_ignore_patterns());

        let patterns = vec!["*.md".to_string(), "dist".to_string()];
        save_ignore_patterns(&path, &patterns).unwrap();
        assert_eq!(load_ignore_patterns(&path), patterns);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_ignore_patterns(&path), get_default_ignore_patterns());
    }

    #[test]
    fn project_name_falls_back_to_directory() {
        let config = Config::default();
        assert_eq!(
            config.get_effective_project_name(Path::new("/work/my-app")),
            "my-app"
        );
    }
}
