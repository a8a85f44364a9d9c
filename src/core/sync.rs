//! Mirror the source tree into a stage working directory.

use glob_match::glob_match;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Paths never copied into a working directory.
///
/// Patterns without a `/` match any path component by name; patterns with a
/// `/` match the path relative to the source root.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // version control
    ".git",
    ".hg",
    ".svn",
    // IDE metadata
    ".idea",
    ".vscode",
    // compiled artifacts
    "*.pyc",
    "*.pyo",
    "__pycache__",
    "node_modules",
    "target",
    // local secrets
    "backends/data/*.json",
    "scripts/variables/stages/*.sh",
    ".env",
    "*.pem",
];

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    pub copied: usize,
    pub unchanged: usize,
    pub excluded: usize,
}

pub fn is_excluded(relative: &str, excludes: &[&str]) -> bool {
    let name = relative.rsplit('/').next().unwrap_or(relative);
    excludes.iter().any(|pattern| {
        if pattern.contains('/') {
            glob_match(pattern, relative)
        } else {
            glob_match(pattern, name)
        }
    })
}

/// Copy `source` into `dest`, skipping excluded paths.
///
/// Files whose destination copy has the same length and is not older than
/// the source are left alone, so repeated runs only copy what changed.
/// A failure part-way leaves already-copied files in place.
pub fn sync_tree(source: &Path, dest: &Path, excludes: &[&str]) -> Result<SyncReport> {
    if !source.is_dir() {
        return Err(Error::sync_failed(
            source.display().to_string(),
            "source is not a directory",
            0,
        ));
    }

    fs::create_dir_all(dest)
        .map_err(|e| Error::sync_failed(dest.display().to_string(), e.to_string(), 0))?;

    let dest_canonical = dest.canonicalize().ok();
    let mut walker = Walker {
        source,
        dest,
        dest_canonical,
        excludes,
        report: SyncReport::default(),
    };
    walker.walk(Path::new(""))?;

    tracing::info!(
        source = %source.display(),
        dest = %dest.display(),
        copied = walker.report.copied,
        unchanged = walker.report.unchanged,
        excluded = walker.report.excluded,
        "Workspace synced"
    );

    Ok(walker.report)
}

struct Walker<'a> {
    source: &'a Path,
    dest: &'a Path,
    dest_canonical: Option<PathBuf>,
    excludes: &'a [&'a str],
    report: SyncReport,
}

impl Walker<'_> {
    fn fail(&self, path: &Path, error: impl ToString) -> Error {
        Error::sync_failed(path.display().to_string(), error.to_string(), self.report.copied)
    }

    fn walk(&mut self, relative: &Path) -> Result<()> {
        let dir = self.source.join(relative);
        let mut entries: Vec<fs::DirEntry> = fs::read_dir(&dir)
            .map_err(|e| self.fail(&dir, e))?
            .collect::<std::io::Result<_>>()
            .map_err(|e| self.fail(&dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let rel = relative.join(entry.file_name());
            let rel_str = rel.to_string_lossy().replace('\\', "/");

            if is_excluded(&rel_str, self.excludes) {
                tracing::debug!(path = %rel_str, "Excluded from sync");
                self.report.excluded += 1;
                continue;
            }

            let src_path = entry.path();
            let file_type = entry.file_type().map_err(|e| self.fail(&src_path, e))?;

            if file_type.is_symlink() && src_path.is_dir() {
                tracing::debug!(path = %rel_str, "Skipping symlinked directory");
                continue;
            }

            if src_path.is_dir() {
                if self.is_dest(&src_path) {
                    continue;
                }
                self.walk(&rel)?;
            } else {
                let target = self.dest.join(&rel);
                self.copy_file(&src_path, &target)?;
            }
        }

        Ok(())
    }

    fn is_dest(&self, path: &Path) -> bool {
        match (&self.dest_canonical, path.canonicalize()) {
            (Some(dest), Ok(candidate)) => &candidate == dest,
            _ => false,
        }
    }

    fn copy_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let src_meta = fs::metadata(src).map_err(|e| self.fail(src, e))?;

        if let Ok(dst_meta) = fs::metadata(dst) {
            let fresh = match (src_meta.modified(), dst_meta.modified()) {
                (Ok(src_time), Ok(dst_time)) => dst_time >= src_time,
                _ => false,
            };
            if dst_meta.is_file() && dst_meta.len() == src_meta.len() && fresh {
                self.report.unchanged += 1;
                return Ok(());
            }
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| self.fail(parent, e))?;
        }
        fs::copy(src, dst).map_err(|e| self.fail(dst, e))?;
        self.report.copied += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn excludes_match_names_and_rooted_paths() {
        assert!(is_excluded(".git", DEFAULT_EXCLUDES));
        assert!(is_excluded("frontend/node_modules", DEFAULT_EXCLUDES));
        assert!(is_excluded("backends/core/models.pyc", DEFAULT_EXCLUDES));
        assert!(is_excluded("backends/data/service-account.json", DEFAULT_EXCLUDES));
        assert!(is_excluded("backends/.env", DEFAULT_EXCLUDES));
        assert!(!is_excluded("backends/core/models.py", DEFAULT_EXCLUDES));
        assert!(!is_excluded("frontend/data/app.json", DEFAULT_EXCLUDES));
        assert!(!is_excluded("backends/data/README.md", DEFAULT_EXCLUDES));
    }

    #[test]
    fn copies_tree_without_excluded_entries() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "backends/core/models.py", "class Pipeline: pass\n");
        write(src.path(), "backends/core/models.pyc", "bytecode");
        write(src.path(), "backends/data/service-account.json", "{\"secret\": 1}");
        write(src.path(), ".git/HEAD", "ref: refs/heads/master\n");
        write(src.path(), ".idea/workspace.xml", "<xml/>");
        write(src.path(), "frontend/src/main.ts", "bootstrap();\n");
        write(src.path(), "scripts/variables/stages/acme.sh", "db_password=secret\n");

        let report = sync_tree(src.path(), dst.path(), DEFAULT_EXCLUDES).unwrap();

        assert_eq!(report.copied, 2);
        assert_eq!(report.excluded, 5);
        assert!(dst.path().join("backends/core/models.py").is_file());
        assert!(dst.path().join("frontend/src/main.ts").is_file());
        assert!(!dst.path().join("backends/core/models.pyc").exists());
        assert!(!dst.path().join("backends/data/service-account.json").exists());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join(".idea").exists());
        assert!(!dst.path().join("scripts/variables/stages/acme.sh").exists());
    }

    #[test]
    fn second_sync_copies_nothing() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "a.txt", "one");
        write(src.path(), "nested/b.txt", "two");

        let first = sync_tree(src.path(), dst.path(), DEFAULT_EXCLUDES).unwrap();
        let second = sync_tree(src.path(), dst.path(), DEFAULT_EXCLUDES).unwrap();

        assert_eq!(first.copied, 2);
        assert_eq!(second.copied, 0);
        assert_eq!(second.unchanged, 2);
    }

    #[test]
    fn changed_file_is_recopied() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "a.txt", "one");
        sync_tree(src.path(), dst.path(), DEFAULT_EXCLUDES).unwrap();

        write(src.path(), "a.txt", "a longer body");
        let report = sync_tree(src.path(), dst.path(), DEFAULT_EXCLUDES).unwrap();

        assert_eq!(report.copied, 1);
        assert_eq!(fs::read_to_string(dst.path().join("a.txt")).unwrap(), "a longer body");
    }

    #[test]
    fn destination_inside_source_is_skipped() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "app.py", "print()\n");
        let dst = src.path().join("build/workdir");

        let report = sync_tree(src.path(), &dst, DEFAULT_EXCLUDES).unwrap();

        assert_eq!(report.copied, 1);
        assert!(dst.join("app.py").is_file());
        assert!(!dst.join("build").exists());
    }

    #[test]
    fn missing_source_is_sync_error() {
        let dst = tempfile::tempdir().unwrap();
        let err = sync_tree(Path::new("/nonexistent/source"), dst.path(), DEFAULT_EXCLUDES)
            .unwrap_err();
        assert_eq!(err.code.as_str(), "sync.failed");
        assert_eq!(err.details["copiedBeforeFailure"], 0);
    }
}
