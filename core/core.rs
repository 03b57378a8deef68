pub mod builtin;
pub mod bundle;
pub mod config;
pub mod document;
pub mod error;
pub mod gather;
pub mod pattern;
pub mod registry;
pub mod session;
pub mod staleness;
pub mod state;
pub mod storage;
pub mod tags;

pub use builtin::{BuiltinIgnores, get_builtin_ignore_patterns, get_default_ignore_patterns};
pub use bundle::{
    BuildOptions, BuiltBundle, BundleKind, BundleManifest, BundleSpec, BundleType, ManifestEntry,
};
pub use config::Config;
pub use error::{AppError, Result};
pub use gather::{FileRecord, TreeNode, enumerate};
pub use pattern::{PatternSet, matches, matches_directory};
pub use registry::{Bundle, list_bundles};
pub use session::ProjectSession;
pub use staleness::{StalenessReport, analyze};
pub use state::{FileStateEntry, MasterBundleRef, StateStore, WatchState};
pub use storage::StorePaths;
pub use tags::{TagDefinition, TagDefinitions};
