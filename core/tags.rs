use crate::error::{AppError, Result};
use crate::storage;
use indexmap::IndexMap;
use log;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const DEFAULT_TAG_COLOR: &str = "#6b7280";

/// A user-defined tag. Persisted as `{"<name>": {"color", "description"}}`,
/// so `name` is the map key rather than a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub description: String,
}

fn default_color() -> String {
    DEFAULT_TAG_COLOR.to_string()
}

impl TagDefinition {
    pub fn new(name: &str, color: Option<&str>, description: Option<&str>) -> Self {
        Self {
            name: name.trim().to_string(),
            color: color.map_or_else(default_color, str::to_string),
            description: description.unwrap_or_default().to_string(),
        }
    }
}

pub type TagDefinitions = IndexMap<String, TagDefinition>;

/// Missing file: no tags. Malformed file: logged, no tags.
pub fn load_tag_definitions(path: &Path) -> TagDefinitions {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return TagDefinitions::new(),
        Err(e) => {
            log::warn!("Failed to read tags from {}: {}", path.display(), e);
            return TagDefinitions::new();
        }
    };
    match serde_json::from_str::<TagDefinitions>(&content) {
        Ok(mut tags) => {
            for (name, def) in tags.iter_mut() {
                def.name = name.clone();
            }
            log::debug!("Loaded {} tag definitions.", tags.len());
            tags
        }
        Err(e) => {
            let err = AppError::ConfigParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            };
            log::warn!("{}. Continuing without tag definitions.", err);
            TagDefinitions::new()
        }
    }
}

pub fn save_tag_definitions(path: &Path, tags: &TagDefinitions) -> Result<()> {
    storage::write_json_atomic(path, tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn definitions_round_trip_with_names_from_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.json");
        let mut tags = TagDefinitions::new();
        tags.insert(
            "core".to_string(),
            TagDefinition::new("core", Some("#ff0000"), Some("Core logic")),
        );
        tags.insert("docs".to_string(), TagDefinition::new("docs", None, None));
        save_tag_definitions(&path, &tags).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"name\""));

        let loaded = load_tag_definitions(&path);
        assert_eq!(loaded, tags);
        assert_eq!(loaded["docs"].color, DEFAULT_TAG_COLOR);
    }

    #[test]
    fn malformed_definitions_yield_empty_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.json");
        fs::write(&path, "export default { core: {} }").unwrap();
        assert!(load_tag_definitions(&path).is_empty());
    }
}
