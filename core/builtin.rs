use once_cell::sync::Lazy;
use serde::Deserialize;

/// Text blocks used for the `ai_readme` header of a bundle document.
#[derive(Debug, Deserialize)]
pub struct BundleReadmeText {
    pub intro: String,
    pub key_sections_header: String,
    pub metadata_desc: String,
    pub tag_desc: String,
    pub tree_desc: String,
    pub documents_desc: String,
    pub empty_desc: String,
}

/// Entries that are never walked, whatever the user's ignore patterns say.
#[derive(Debug, Default, Deserialize)]
pub struct BuiltinIgnores {
    #[serde(default)]
    pub directories: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl BuiltinIgnores {
    /// True when any component of `relative_path` is an always-ignored
    /// directory, or the final component is an always-ignored file name.
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        let mut components = relative_path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            let is_last = components.peek().is_none();
            if (!is_last || is_dir)
                && self
                    .directories
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(component))
            {
                return true;
            }
            if is_last && !is_dir && self.files.iter().any(|f| f.eq_ignore_ascii_case(component)) {
                return true;
            }
        }
        false
    }
}

static BUNDLE_README_TEXT: Lazy<BundleReadmeText> = Lazy::new(|| {
    let yaml_content = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../data/bundle_readme.yaml"
    ));
    serde_yml::from_str(yaml_content).expect("Failed to parse embedded data/bundle_readme.yaml")
});
static BUILTIN_IGNORE_PATTERNS: Lazy<BuiltinIgnores> = Lazy::new(|| {
    let yaml_content = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../data/builtin_ignores.yaml"
    ));
    serde_yml::from_str(yaml_content).expect("Failed to parse embedded data/builtin_ignores.yaml")
});
static DEFAULT_IGNORE_PATTERNS: Lazy<Vec<String>> = Lazy::new(|| {
    let yaml_content = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../data/default_ignores.yaml"
    ));
    serde_yml::from_str(yaml_content).expect("Failed to parse embedded data/default_ignores.yaml")
});

pub fn get_bundle_readme_text() -> &'static BundleReadmeText {
    &BUNDLE_README_TEXT
}
pub fn get_builtin_ignore_patterns() -> &'static BuiltinIgnores {
    &BUILTIN_IGNORE_PATTERNS
}
pub fn get_default_ignore_patterns() -> &'static [String] {
    &DEFAULT_IGNORE_PATTERNS
}
