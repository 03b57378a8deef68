mod common;

use common::{project, strings};
use xbundle_core::gather::{self, EnumerateOptions};
use xbundle_core::{PatternSet, enumerate};

fn paths(records: &[xbundle_core::FileRecord]) -> Vec<&str> {
    records.iter().map(|r| r.path.as_str()).collect()
}

#[test]
fn test_always_ignored_directories_are_pruned() {
    let dir = project(&[
        ("src/main.ts", "main"),
        ("node_modules/left-pad/index.js", "pad"),
        (".git/HEAD", "ref: refs/heads/main"),
        ("packages/web/node_modules/x.js", "x"),
        (".xtools/xbundle/state/file.json", "{}"),
    ]);
    let records = enumerate(dir.path(), &[]);
    assert_eq!(paths(&records), vec!["src/main.ts"]);
}

#[test]
fn test_user_patterns_prune_and_skip() {
    let dir = project(&[
        ("src/app.ts", "app"),
        ("src/App.test.TS", "test"),
        ("docs/guide/intro.md", "intro"),
        ("README.md", "readme"),
        ("build/out.js", "out"),
        (".env", "SECRET=1"),
    ]);
    let records = enumerate(dir.path(), &strings(&["*.md", "build", "**/*.test.ts"]));
    assert_eq!(paths(&records), vec![".env", "src/app.ts"]);
}

#[test]
fn test_user_patterns_cannot_unignore_builtins() {
    let dir = project(&[("node_modules/a.js", "a"), ("b.js", "b")]);
    let ignore = PatternSet::new(&["!node_modules"]);
    let records = gather::enumerate_with(dir.path(), &ignore, EnumerateOptions::default());
    assert_eq!(paths(&records), vec!["b.js"]);
}

#[test]
fn test_records_carry_content_and_metadata() {
    let dir = project(&[("lib/util.rs", "pub fn f() {}\n")]);
    std::fs::write(dir.path().join("logo.png"), [0x89, 0x50, 0xff, 0xfe, 0x00]).unwrap();

    let records = enumerate(dir.path(), &[]);
    assert_eq!(records.len(), 2);
    let util = records.iter().find(|r| r.path == "lib/util.rs").unwrap();
    assert_eq!(util.name, "util.rs");
    assert_eq!(util.directory, "lib");
    assert_eq!(util.extension(), "rs");
    assert_eq!(util.size, 14);
    assert_eq!(util.content, "pub fn f() {}\n");

    let logo = records.iter().find(|r| r.path == "logo.png").unwrap();
    assert!(logo.binary);
    assert!(logo.content.is_empty());
}

#[test]
fn test_invalid_pattern_does_not_abort_walk() {
    let dir = project(&[("a.ts", "a"), ("b[.ts", "b")]);
    let records = enumerate(dir.path(), &strings(&["src/[", "b[.ts"]));
    assert_eq!(paths(&records), vec!["a.ts"]);
}

#[test]
fn test_refresh_marks_changes_against_master() {
    let dir = project(&[("a.ts", "a"), ("b.ts", "b")]);
    let session = xbundle_core::ProjectSession::open(dir.path());
    let before = session.refresh_files().unwrap();
    assert!(before.iter().all(|r| r.is_changed));

    session.create_master_bundle().unwrap();
    let after = session.refresh_files().unwrap();
    assert!(after.iter().all(|r| !r.is_changed));
    assert!(after.iter().all(|r| r.master_bundle_id.is_some()));

    let later = filetime::FileTime::from_unix_time(4_102_444_800, 0);
    filetime::set_file_mtime(dir.path().join("b.ts"), later).unwrap();
    let changed: Vec<String> = session
        .refresh_files()
        .unwrap()
        .into_iter()
        .filter(|r| r.is_changed)
        .map(|r| r.path)
        .collect();
    assert_eq!(changed, vec!["b.ts"]);
}

#[cfg(unix)]
#[test]
fn test_unlistable_directory_is_skipped() {
    use std::os::unix::fs::PermissionsExt;

    let dir = project(&[("a/one.ts", "1"), ("locked/secret.ts", "s"), ("z/two.ts", "2")]);
    let locked = dir.path().join("locked");
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
    let listable = std::fs::read_dir(&locked).is_ok();

    let records = enumerate(dir.path(), &[]);
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

    let found = paths(&records);
    assert!(found.contains(&"a/one.ts"));
    assert!(found.contains(&"z/two.ts"));
    // Privileged users can still list the directory.
    if !listable {
        assert!(!found.contains(&"locked/secret.ts"));
    }
}
