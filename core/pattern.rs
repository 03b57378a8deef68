//! Glob-like ignore/include pattern matching against project-relative paths.
//!
//! All comparisons are case-insensitive: paths and patterns are lowercased
//! before any check, and compiled globs are built case-insensitive as well.

use globset::{GlobBuilder, GlobMatcher};
use log;

#[derive(Debug, Clone)]
enum Matcher {
    /// `**/*`
    Everything,
    /// `*`: only entries directly under the root.
    TopLevel,
    Glob(GlobMatcher),
    /// Empty or uncompilable pattern; only exact equality can match.
    Invalid,
}

/// A single pattern, compiled once and matched many times.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    raw: String,
    normalized: String,
    directory_form: String,
    extension_suffix: Option<String>,
    matcher: Matcher,
}

impl CompiledPattern {
    pub fn new(pattern: &str) -> Self {
        let raw = pattern.to_string();
        let mut normalized = normalize_path(pattern.trim());
        let directory_form = normalized.trim_end_matches('/').to_string();

        let matcher = if normalized.is_empty() {
            Matcher::Invalid
        } else if normalized == "**/*" {
            Matcher::Everything
        } else if normalized == "*" {
            Matcher::TopLevel
        } else {
            if normalized.ends_with('/') {
                normalized = format!("{}/**", directory_form);
            }
            match GlobBuilder::new(&normalized)
                .literal_separator(true)
                .case_insensitive(true)
                .backslash_escape(false)
                .build()
            {
                Ok(glob) => {
                    log::trace!("Compiled pattern \"{}\" as \"{}\"", raw, normalized);
                    Matcher::Glob(glob.compile_matcher())
                }
                Err(e) => {
                    log::error!("Invalid glob pattern \"{}\": {}", raw, e);
                    Matcher::Invalid
                }
            }
        };

        Self {
            extension_suffix: extension_suffix(&normalized),
            raw,
            normalized,
            directory_form,
            matcher,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.matcher, Matcher::Invalid)
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matches_normalized(&normalize_path(path))
    }

    /// Like [`matches`](Self::matches), but a directory pattern also matches
    /// the directory at any nesting depth and everything below it.
    pub fn matches_directory(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let dir = self.directory_form.as_str();
        if !dir.is_empty()
            && (path == dir
                || path.starts_with(&format!("{}/", dir))
                || path.ends_with(&format!("/{}", dir))
                || path.contains(&format!("/{}/", dir)))
        {
            return true;
        }
        self.matches_normalized(&path)
    }

    fn matches_normalized(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Everything => return true,
            Matcher::TopLevel => return !path.contains('/'),
            _ if self.normalized.is_empty() => return false,
            _ => {}
        }
        if path == self.normalized {
            return true;
        }
        if let Some(suffix) = &self.extension_suffix {
            if path.ends_with(suffix.as_str()) {
                return true;
            }
        }
        match &self.matcher {
            Matcher::Glob(glob) => glob.is_match(path),
            _ => false,
        }
    }
}

/// An ordered list of compiled patterns, e.g. the project's ignore list.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<CompiledPattern>,
}

impl PatternSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| CompiledPattern::new(p.as_ref()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// First pattern matching a directory entry.
    pub fn match_directory(&self, path: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.matches_directory(path))
            .map(CompiledPattern::as_str)
    }

    /// First pattern matching a file, either directly or through one of
    /// its parent directories.
    pub fn match_file(&self, path: &str) -> Option<&str> {
        let normalized = normalize_path(path);
        let parent = normalized.rsplit_once('/').map(|(dir, _)| dir);
        self.patterns
            .iter()
            .find(|p| {
                p.matches_normalized(&normalized)
                    || parent.is_some_and(|dir| p.matches_directory(dir))
            })
            .map(CompiledPattern::as_str)
    }

    pub fn is_ignored(&self, path: &str, is_dir: bool) -> bool {
        if is_dir {
            self.match_directory(path).is_some()
        } else {
            self.match_file(path).is_some()
        }
    }
}

pub fn matches(path: &str, pattern: &str) -> bool {
    CompiledPattern::new(pattern).matches(path)
}

pub fn matches_directory(path: &str, pattern: &str) -> bool {
    CompiledPattern::new(pattern).matches_directory(path)
}

/// Forward slashes, no leading `./` or `/`, lowercase.
pub fn normalize_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let mut trimmed = forward.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.trim_start_matches('/').to_lowercase()
}

/// `*.ext` (no further wildcards or separators) yields `.ext`.
fn extension_suffix(pattern: &str) -> Option<String> {
    let ext = pattern.strip_prefix("*.")?;
    if ext.is_empty() || ext.contains(['*', '?', '[', ']', '{', '}', '/']) {
        return None;
    }
    Some(format!(".{}", ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_patterns() {
        assert!(matches("src/deep/app.ts", "**/*"));
        assert!(matches("app.ts", "*"));
        assert!(!matches("src/app.ts", "*"));
    }

    #[test]
    fn exact_and_glob_matches() {
        assert!(matches("src/app.ts", "src/app.ts"));
        assert!(matches("src/app.ts", "**/*.ts"));
        assert!(matches("app.ts", "**/*.ts"));
        assert!(matches("src/app.ts", "src/*.ts"));
        assert!(!matches("src/nested/app.ts", "src/*.ts"));
        assert!(matches("src/nested/app.ts", "src/**"));
        assert!(matches("a1.txt", "a?.txt"));
        assert!(!matches("a12.txt", "a?.txt"));
    }

    #[test]
    fn dot_is_literal() {
        assert!(matches("file.rs", "file.rs"));
        assert!(!matches("filexrs", "file.rs"));
    }

    #[test]
    fn extension_shorthand_matches_at_any_depth() {
        assert!(matches("README.md", "*.md"));
        assert!(matches("docs/guide/intro.MD", "*.md"));
        assert!(!matches("docs/guide/intro.mdx", "*.md"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(matches("Src/App.TS", "src/*.ts"));
        assert!(matches("LICENSE", "license"));
        assert!(matches_directory("Vendor/lib.js", "vendor"));
    }

    #[test]
    fn directory_variant_matches_at_any_depth() {
        assert!(matches_directory("node_modules/x.js", "node_modules"));
        assert!(matches_directory("node_modules", "node_modules"));
        assert!(matches_directory("packages/a/node_modules", "node_modules"));
        assert!(matches_directory("packages/node_modules/x", "node_modules"));
        assert!(matches_directory("build", "build/"));
        assert!(!matches_directory("builder", "build"));
        assert!(!matches("node_modules/x.js", "node_modules"));
    }

    #[test]
    fn invalid_pattern_never_matches() {
        let pattern = CompiledPattern::new("src/[unclosed");
        assert!(!pattern.is_valid());
        assert!(!pattern.matches("src/other"));
        // Exact equality is checked before compilation.
        assert!(pattern.matches("src/[unclosed"));
        assert!(!matches("anything", ""));
    }

    #[test]
    fn backslashes_in_patterns_are_separators() {
        assert!(matches("src/app.ts", "src\\*.ts"));
        assert!(matches("web/dist/app.js", "web\\dist\\"));
        assert!(!matches("src/nested/app.ts", "src\\*.ts"));
    }

    #[test]
    fn pattern_set_checks_parent_directories_for_files() {
        let set = PatternSet::new(&["dist", "*.log"]);
        assert_eq!(set.match_file("dist/bundle.js"), Some("dist"));
        assert_eq!(set.match_file("web/dist/bundle.js"), Some("dist"));
        assert_eq!(set.match_file("logs/server.log"), Some("*.log"));
        assert_eq!(set.match_file("src/main.rs"), None);
        assert!(set.is_ignored("web/dist", true));
        assert!(!set.is_ignored("web/distribution", true));
    }
}
