use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sweep_core::SweepError;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub run_dir: PathBuf,
    pub complete: bool,
}

/// Complete when `sentinel` sits directly inside the directory. Each call
/// starts a fresh walk.
pub fn audit_iter<'a>(
    root: &'a Path,
    pattern: &'a str,
    sentinel: &'a str,
) -> Result<impl Iterator<Item = Result<AuditEntry>> + 'a> {
    if !root.is_dir() {
        return Err(SweepError::NotFound(root.to_path_buf()).into());
    }
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| match entry {
            Err(e) => Some(Err(e.into())),
            Ok(entry) => {
                if !entry.file_type().is_dir() {
                    return None;
                }
                let name = entry.file_name().to_string_lossy();
                if !name.contains(pattern) {
                    return None;
                }
                let complete = entry.path().join(sentinel).is_file();
                let run_dir = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .to_path_buf();
                Some(Ok(AuditEntry { run_dir, complete }))
            }
        });
    Ok(walker)
}

pub fn audit(root: &Path, pattern: &str, sentinel: &str) -> Result<BTreeMap<PathBuf, bool>> {
    let mut out = BTreeMap::new();
    for entry in audit_iter(root, pattern, sentinel)? {
        let entry = entry?;
        out.insert(entry.run_dir, entry.complete);
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct AuditSummary {
    pub total: usize,
    pub complete: usize,
    pub incomplete: Vec<PathBuf>,
}

pub fn summarize(results: &BTreeMap<PathBuf, bool>) -> AuditSummary {
    let mut summary = AuditSummary {
        total: results.len(),
        ..AuditSummary::default()
    };
    for (dir, done) in results {
        if *done {
            summary.complete += 1;
        } else {
            summary.incomplete.push(dir.clone());
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use sweep_core::{ensure_dir, COMPLETION_SENTINEL};

    fn output_tree(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sweep_audit_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root.join("run_a_spintuneup").join("flx")).expect("a");
        ensure_dir(&root.join("run_b_spintuneup")).expect("b");
        ensure_dir(&root.join("unrelated")).expect("c");
        fs::write(root.join("run_a_spintuneup").join(COMPLETION_SENTINEL), "").expect("s");
        fs::write(root.join("unrelated").join(COMPLETION_SENTINEL), "").expect("s");
        root
    }

    #[test]
    fn reports_sentinel_presence_for_matching_dirs_only() {
        let root = output_tree("scenario");
        let results = audit(&root, "spintuneup", COMPLETION_SENTINEL).expect("audit");
        let expected: BTreeMap<PathBuf, bool> = [
            (PathBuf::from("run_a_spintuneup"), true),
            (PathBuf::from("run_b_spintuneup"), false),
        ]
        .into_iter()
        .collect();
        assert_eq!(results, expected);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn repeated_audits_agree() {
        let root = output_tree("repeat");
        let first = audit(&root, "spintuneup", COMPLETION_SENTINEL).expect("first");
        let second = audit(&root, "spintuneup", COMPLETION_SENTINEL).expect("second");
        assert_eq!(first, second);
        let summary = summarize(&first);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.complete, 1);
        assert_eq!(summary.incomplete, vec![PathBuf::from("run_b_spintuneup")]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn sentinel_in_a_subdirectory_does_not_count() {
        let root = output_tree("nested");
        fs::write(
            root.join("run_b_spintuneup").join("nested_marker"),
            "",
        )
        .expect("marker");
        ensure_dir(&root.join("run_b_spintuneup").join("prof")).expect("prof");
        fs::write(
            root.join("run_b_spintuneup").join("prof").join(COMPLETION_SENTINEL),
            "",
        )
        .expect("nested sentinel");
        let results = audit(&root, "spintuneup", COMPLETION_SENTINEL).expect("audit");
        assert_eq!(results.get(Path::new("run_b_spintuneup")), Some(&false));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_root_is_not_found() {
        let root = std::env::temp_dir().join("sweep_audit_definitely_missing_root");
        let err = audit(&root, "x", COMPLETION_SENTINEL).expect_err("missing");
        assert!(err.to_string().contains("File not found"));
    }
}
