use crate::bundle::BundleManifest;
use crate::gather::FileRecord;
use indexmap::IndexMap;
use log;
use serde::Serialize;
use std::collections::HashMap;

/// Drift of a bundle's files since it was built. Pure read-time data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StalenessReport {
    pub fresh_paths: Vec<String>,
    pub stale_paths: Vec<String>,
    pub missing_paths: Vec<String>,
    /// Tag name to number of manifested files carrying it, in first-seen order.
    pub tag_counts: IndexMap<String, usize>,
    /// `round(100 * stale / (stale + fresh))`; 0 when nothing is tracked.
    pub staleness_percent: u8,
    /// Set when the analysis could not run, e.g. the manifest is missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StalenessReport {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            note: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.fresh_paths.len() + self.stale_paths.len()
    }

    pub fn is_stale(&self) -> bool {
        !self.stale_paths.is_empty() || !self.missing_paths.is_empty()
    }
}

pub fn analyze(manifest: Option<&BundleManifest>, live: &[FileRecord]) -> StalenessReport {
    let Some(manifest) = manifest else {
        log::debug!("No manifest supplied; staleness unavailable.");
        return StalenessReport::unavailable("Staleness analysis unavailable: no manifest");
    };

    let live_by_path: HashMap<&str, &FileRecord> =
        live.iter().map(|r| (r.path.as_str(), r)).collect();
    let mut report = StalenessReport::default();

    for entry in &manifest.files {
        let live_record = live_by_path.get(entry.path.as_str());
        match live_record {
            Some(record) if record.last_modified > entry.last_modified => {
                report.stale_paths.push(entry.path.clone())
            }
            Some(_) => report.fresh_paths.push(entry.path.clone()),
            None => report.missing_paths.push(entry.path.clone()),
        }

        let tags: &[String] = if entry.tags.is_empty() {
            live_record.map(|r| r.tags.as_slice()).unwrap_or_default()
        } else {
            &entry.tags
        };
        for tag in tags {
            *report.tag_counts.entry(tag.clone()).or_insert(0) += 1;
        }
    }

    report.staleness_percent = percent(report.stale_paths.len(), report.tracked_count());
    log::debug!(
        "Bundle {}: {} fresh, {} stale, {} missing ({}% stale).",
        manifest.id,
        report.fresh_paths.len(),
        report.stale_paths.len(),
        report.missing_paths.len(),
        report.staleness_percent
    );
    report
}

fn percent(part: usize, whole: usize) -> u8 {
    if whole == 0 {
        return 0;
    }
    ((part as f64 * 100.0 / whole as f64).round()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ManifestEntry;
    use chrono::{Duration, TimeZone, Utc};

    fn manifest(entries: &[(&str, &[&str])]) -> BundleManifest {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        BundleManifest {
            id: "custom-1".to_string(),
            created: t0,
            file_count: entries.len(),
            files: entries
                .iter()
                .map(|(path, tags)| ManifestEntry {
                    path: path.to_string(),
                    last_modified: t0,
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                })
                .collect(),
            bundle_type: None,
            derived_from_tag: None,
            description: None,
            name: None,
            patterns: Vec::new(),
        }
    }

    fn live(path: &str, offset_secs: i64, tags: &[&str]) -> FileRecord {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut record = FileRecord::new(path, t0 + Duration::seconds(offset_secs), 1, String::new());
        record.tags = tags.iter().map(|t| t.to_string()).collect();
        record
    }

    #[test]
    fn classifies_fresh_stale_and_missing() {
        let m = manifest(&[("a.ts", &["core"]), ("b.ts", &[]), ("c.ts", &["core"])]);
        let report = analyze(Some(&m), &[live("a.ts", 0, &[]), live("b.ts", 60, &["ui"])]);
        assert_eq!(report.fresh_paths, vec!["a.ts"]);
        assert_eq!(report.stale_paths, vec!["b.ts"]);
        assert_eq!(report.missing_paths, vec!["c.ts"]);
        assert_eq!(report.staleness_percent, 50);
        // Manifest tags first, live tags only where the manifest has none.
        assert_eq!(report.tag_counts.get("core"), Some(&2));
        assert_eq!(report.tag_counts.get("ui"), Some(&1));
        assert!(report.is_stale());
    }

    #[test]
    fn rounding_and_empty_denominator() {
        let m = manifest(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let report = analyze(Some(&m), &[live("a", 5, &[]), live("b", 0, &[]), live("c", 0, &[])]);
        assert_eq!(report.staleness_percent, 33);

        let gone = analyze(Some(&m), &[]);
        assert_eq!(gone.staleness_percent, 0);
        assert_eq!(gone.missing_paths.len(), 3);
    }

    #[test]
    fn missing_manifest_yields_zero_result_with_note() {
        let report = analyze(None, &[live("a", 0, &[])]);
        assert_eq!(report.staleness_percent, 0);
        assert!(report.fresh_paths.is_empty());
        assert!(report.note.is_some());
    }
}
