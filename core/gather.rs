use crate::builtin::get_builtin_ignore_patterns;
use crate::error::AppError;
use crate::pattern::PatternSet;
use crate::state::split_path;
use chrono::{DateTime, Utc};
use ignore::{WalkBuilder, WalkState};
use log;
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, mpsc};

/// One watched file, as seen by the latest enumeration pass merged with the
/// persisted state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub directory: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    #[serde(skip)]
    pub content: String,
    /// Not valid UTF-8; `content` is left empty.
    pub binary: bool,
    pub is_staged: bool,
    pub is_changed: bool,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_bundle_id: Option<String>,
}

impl FileRecord {
    pub fn new(path: &str, last_modified: DateTime<Utc>, size: u64, content: String) -> Self {
        let (directory, name) = split_path(path);
        Self {
            path: path.to_string(),
            name: name.to_string(),
            directory: directory.to_string(),
            last_modified,
            size,
            content,
            binary: false,
            is_staged: false,
            is_changed: true,
            tags: Vec::new(),
            master_bundle_id: None,
        }
    }

    pub fn extension(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext,
            _ => "",
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnumerateOptions {
    /// Also honour `.gitignore`/`.ignore` files found in the tree.
    pub use_gitignore: bool,
}

/// Walks `project_root` and returns every file that survives the built-in
/// ignores and `ignore_patterns`, with content read.
pub fn enumerate(project_root: &Path, ignore_patterns: &[String]) -> Vec<FileRecord> {
    enumerate_with(
        project_root,
        &PatternSet::new(ignore_patterns),
        EnumerateOptions::default(),
    )
}

pub fn enumerate_with(
    project_root: &Path,
    ignore_set: &PatternSet,
    options: EnumerateOptions,
) -> Vec<FileRecord> {
    log::debug!(
        "Enumerating {} with {} ignore patterns (gitignore: {})",
        project_root.display(),
        ignore_set.len(),
        options.use_gitignore
    );

    let mut builder = WalkBuilder::new(project_root);
    builder.threads(rayon::current_num_threads().min(12));
    builder.hidden(false);
    builder.parents(false);
    builder.ignore(options.use_gitignore);
    builder.git_ignore(options.use_gitignore);
    builder.git_exclude(options.use_gitignore);
    builder.git_global(false);
    builder.require_git(false);

    let walker = builder.build_parallel();
    let project_root_clone = project_root.to_path_buf();
    let ignore_set = Arc::new(ignore_set.clone());

    #[derive(Debug)]
    struct WalkedFile {
        path: PathBuf,
        relative_path: String,
    }
    let (tx_walked, rx_walked) = mpsc::channel::<WalkedFile>();
    let tx_for_closure = tx_walked.clone();

    walker.run(move || {
        let tx_thread = tx_for_closure.clone();
        let proj_root = project_root_clone.clone();
        let ignore_set = Arc::clone(&ignore_set);
        let builtin = get_builtin_ignore_patterns();

        Box::new(move |entry_result| {
            let entry = match entry_result {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("{}", AppError::DirectoryList(e.to_string()));
                    return WalkState::Continue;
                }
            };
            if entry.depth() == 0 {
                return WalkState::Continue;
            }
            let path = entry.path();
            let Some(relative) = pathdiff::diff_paths(path, &proj_root) else {
                log::warn!("Could not get relative path for: {}", path.display());
                return WalkState::Continue;
            };
            let relative_path = to_forward_slashes(&relative);
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            let prune = if is_dir {
                WalkState::Skip
            } else {
                WalkState::Continue
            };

            if builtin.is_ignored(&relative_path, is_dir) {
                log::trace!("Always-ignored: {}", relative_path);
                return prune;
            }
            let matched = if is_dir {
                ignore_set.match_directory(&relative_path)
            } else {
                ignore_set.match_file(&relative_path)
            };
            if let Some(pattern) = matched {
                log::trace!("Ignored by \"{}\": {}", pattern, relative_path);
                return prune;
            }
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                return WalkState::Continue;
            }

            if tx_thread
                .send(WalkedFile {
                    path: path.to_path_buf(),
                    relative_path,
                })
                .is_err()
            {
                log::error!("Receiver dropped for walked paths, stopping walk early.");
                return WalkState::Quit;
            }
            WalkState::Continue
        })
    });
    drop(tx_walked);

    let walked: Vec<WalkedFile> = rx_walked.into_iter().collect();
    log::debug!("Walk complete, reading {} files.", walked.len());

    let mut records: Vec<FileRecord> = walked
        .into_par_iter()
        .filter_map(|w| read_record_at(&w.path, &w.relative_path, true))
        .collect();
    records.par_sort_unstable_by(|a, b| a.path.cmp(&b.path));
    log::info!(
        "Enumerated {} files under {}",
        records.len(),
        project_root.display()
    );
    records
}

/// Reads a single project file. `None` when it does not exist (or is not a
/// regular file); a read failure yields a record with empty content.
pub fn read_file_record(project_root: &Path, relative_path: &str) -> Option<FileRecord> {
    read_record_at(&project_root.join(relative_path), relative_path, true)
}

/// Metadata-only records for `relative_paths`; missing files are omitted.
pub fn stat_paths(project_root: &Path, relative_paths: &[String]) -> Vec<FileRecord> {
    relative_paths
        .par_iter()
        .filter_map(|rel| read_record_at(&project_root.join(rel), rel, false))
        .collect()
}

fn read_record_at(absolute: &Path, relative_path: &str, with_content: bool) -> Option<FileRecord> {
    let metadata = match fs::metadata(absolute) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return None,
        Err(e) => {
            log::debug!("Skipping {}: {}", absolute.display(), e);
            return None;
        }
    };
    let last_modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|e| {
            log::warn!("No modification time for {}: {}", absolute.display(), e);
            DateTime::<Utc>::from(std::time::UNIX_EPOCH)
        });
    let mut record = FileRecord::new(relative_path, last_modified, metadata.len(), String::new());
    if !with_content {
        return Some(record);
    }

    match fs::read(absolute) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(content) => record.content = content,
            Err(_) => {
                log::debug!("Non-UTF-8 file, content omitted: {}", relative_path);
                record.binary = true;
            }
        },
        Err(e) => {
            let err = AppError::FileRead {
                path: absolute.to_path_buf(),
                source: e,
            };
            log::warn!("{}; recording empty content.", err);
        }
    }
    Some(record)
}

fn to_forward_slashes(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// Nested tree of the given file paths; at every level directories come
/// before files, each group sorted alphabetically.
pub fn build_tree_from_paths<S: AsRef<str>>(file_paths: &[S]) -> Vec<TreeNode> {
    let mut root_nodes: Vec<TreeNode> = Vec::new();
    for path in file_paths {
        let components: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();
        if !components.is_empty() {
            insert_node(&mut root_nodes, &components);
        }
    }
    sort_nodes(&mut root_nodes);
    root_nodes
}

fn insert_node(level: &mut Vec<TreeNode>, components: &[&str]) {
    let Some((name, rest)) = components.split_first() else {
        return;
    };
    let kind = if rest.is_empty() {
        NodeKind::File
    } else {
        NodeKind::Directory
    };
    let index = match level.iter().position(|n| n.name == *name && n.kind == kind) {
        Some(index) => index,
        None => {
            level.push(TreeNode {
                name: name.to_string(),
                kind,
                children: Vec::new(),
            });
            level.len() - 1
        }
    };
    if !rest.is_empty() {
        insert_node(&mut level[index].children, rest);
    }
}

fn sort_nodes(nodes: &mut [TreeNode]) {
    nodes.sort_by(|a, b| match (a.kind, b.kind) {
        (NodeKind::Directory, NodeKind::File) => Ordering::Less,
        (NodeKind::File, NodeKind::Directory) => Ordering::Greater,
        _ => a
            .name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name)),
    });
    for node in nodes.iter_mut() {
        sort_nodes(&mut node.children);
    }
}

/// Indented ASCII rendering, rooted at `root_name`.
pub fn render_ascii_tree(root_name: &str, nodes: &[TreeNode]) -> String {
    let mut out = format!("{}/\n", root_name);
    render_level(nodes, "", &mut out);
    out
}

fn render_level(nodes: &[TreeNode], prefix: &str, out: &mut String) {
    for (i, node) in nodes.iter().enumerate() {
        let last = i + 1 == nodes.len();
        out.push_str(prefix);
        out.push_str(if last { "└── " } else { "├── " });
        out.push_str(&node.name);
        if node.kind == NodeKind::Directory {
            out.push('/');
        }
        out.push('\n');
        if !node.children.is_empty() {
            let child_prefix = format!("{}{}", prefix, if last { "    " } else { "│   " });
            render_level(&node.children, &child_prefix, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_puts_directories_first() {
        let tree = build_tree_from_paths(&["zeta.txt", "src/b.rs", "src/a/x.rs", "Alpha.md", "lib/c.rs"]);
        let names: Vec<&str> = tree.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["lib", "src", "Alpha.md", "zeta.txt"]);
        let src: Vec<&str> = tree[1].children.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(src, vec!["a", "b.rs"]);
    }

    #[test]
    fn ascii_rendering_uses_box_drawing() {
        let tree = build_tree_from_paths(&["src/main.rs", "src/util/mod.rs", "README.md"]);
        let ascii = render_ascii_tree("demo", &tree);
        let expected = "demo/\n\
├── src/\n\
│   ├── util/\n\
│   │   └── mod.rs\n\
│   └── main.rs\n\
└── README.md\n";
        assert_eq!(ascii, expected);
    }

    #[test]
    fn record_derives_name_directory_and_extension() {
        let record = FileRecord::new("src/app.test.ts", Utc::now(), 3, "abc".into());
        assert_eq!(record.name, "app.test.ts");
        assert_eq!(record.directory, "src");
        assert_eq!(record.extension(), "ts");
        assert_eq!(FileRecord::new(".env", Utc::now(), 0, String::new()).extension(), "");
    }
}
