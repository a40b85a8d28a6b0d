//! Directory transfers built from single-file operations.
//!
//! Per-file failures are collected in a [`DirectoryTransferReport`]
//! instead of aborting the whole transfer.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use egs_core::error::{Error, Result};
use egs_core::session::Session;
use egs_core::status;

use crate::ops::{download_file, list_directory, upload_file};

/// Outcome of a directory transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryTransferReport {
    /// Files copied.
    pub transferred: usize,
    /// Files left alone because the destination already existed.
    pub skipped: Vec<String>,
    /// Remote subdirectories not visited because the transfer was not recursive.
    pub skipped_directories: Vec<String>,
    /// Files (or subdirectories) that failed.
    pub failed: Vec<String>,
}

impl DirectoryTransferReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: DirectoryTransferReport) {
        self.transferred += other.transferred;
        self.skipped.extend(other.skipped);
        self.skipped_directories.extend(other.skipped_directories);
        self.failed.extend(other.failed);
    }
}

/// Files under `root`, recursively when asked, sorted by path.
fn collect_files(root: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if recursive {
                    pending.push(entry.path());
                }
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// `/` separated path of `file` relative to `root`.
fn relative_path(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let segments: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(segments.join("/"))
}

/// Whether a download may write its local destination.
#[derive(Debug)]
enum LocalTarget {
    Free,
    Exists,
    Unknown(std::io::Error),
}

fn existing_local(exists: std::io::Result<bool>) -> LocalTarget {
    match exists {
        Ok(false) => LocalTarget::Free,
        Ok(true) => LocalTarget::Exists,
        Err(e) => LocalTarget::Unknown(e),
    }
}

/// Upload the files of `source` below the guest directory `target`.
///
/// A file the guest refuses because it exists is reported as skipped.
pub async fn upload_directory(
    session: &Session,
    source: &Path,
    target: &str,
    overwrite: bool,
    recursive: bool,
) -> Result<DirectoryTransferReport> {
    let files = collect_files(source, recursive)?;
    info!(source = %source.display(), files = files.len(), recursive, "Uploading directory");

    let mut report = DirectoryTransferReport::default();
    for file in files {
        let Some(relative) = relative_path(source, &file) else {
            continue;
        };
        match upload_file(session, &file, target, &relative, overwrite).await {
            Ok(transfer) if transfer.is_success() => {
                debug!(path = %relative, bytes = transfer.bytes, "Uploaded");
                report.transferred += 1;
            }
            Ok(transfer) if transfer.status == status::FILE_EXISTS => {
                warn!(path = %relative, "Exists at the destination, not overwritten");
                report.skipped.push(relative);
            }
            Ok(transfer) => {
                warn!(path = %relative, status = transfer.status, "Upload failed");
                report.failed.push(relative);
            }
            Err(e) => {
                warn!(path = %relative, error = %e, "Upload failed");
                report.failed.push(relative);
            }
        }
    }
    Ok(report)
}

/// Download the guest directory `source` into `target`.
///
/// Subdirectories are only visited when `recursive` is set; otherwise they
/// are recorded in `skipped_directories`. Existing local files are kept
/// unless `overwrite` is set.
pub async fn download_directory(
    session: &Session,
    source: &str,
    target: &Path,
    overwrite: bool,
    recursive: bool,
) -> Result<DirectoryTransferReport> {
    let listing = list_directory(session, source).await?;
    if listing.status != status::SUCCESS {
        let reason = status::describe(listing.status).unwrap_or("listing failed");
        return Err(Error::FileTransfer {
            message: format!("cannot list {}: {} ({:#x})", source, reason, listing.status),
        });
    }

    tokio::fs::create_dir_all(target).await?;
    info!(source, target = %target.display(), entries = listing.entries.len(), recursive, "Downloading directory");

    let mut report = DirectoryTransferReport::default();
    for entry in listing.entries {
        let local = target.join(&entry.name);

        if entry.is_directory {
            if !recursive {
                debug!(path = %entry.full_path, "Subdirectory skipped");
                report.skipped_directories.push(entry.full_path);
                continue;
            }
            match Box::pin(download_directory(session, &entry.full_path, &local, overwrite, recursive)).await {
                Ok(sub) => report.merge(sub),
                Err(e) => {
                    warn!(path = %entry.full_path, error = %e, "Subdirectory failed");
                    report.failed.push(entry.full_path);
                }
            }
            continue;
        }

        if !overwrite {
            match existing_local(tokio::fs::try_exists(&local).await) {
                LocalTarget::Free => {}
                LocalTarget::Exists => {
                    warn!(path = %local.display(), "Exists locally, skipped");
                    report.skipped.push(entry.full_path);
                    continue;
                }
                LocalTarget::Unknown(e) => {
                    warn!(path = %local.display(), error = %e, "Cannot check local file");
                    report.failed.push(entry.full_path);
                    continue;
                }
            }
        }

        match download_file(session, &entry.full_path, &local).await {
            Ok(transfer) if transfer.is_success() => report.transferred += 1,
            Ok(transfer) => {
                warn!(path = %entry.full_path, status = transfer.status, "Download failed");
                report.failed.push(entry.full_path);
            }
            Err(e) => {
                warn!(path = %entry.full_path, error = %e, "Download failed");
                report.failed.push(entry.full_path);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::served_session;
    use egs_test_utils::{temp_dir, write_file};

    #[test]
    fn relative_paths_use_forward_slashes() {
        let root = Path::new("/data");
        assert_eq!(
            relative_path(root, &root.join("a").join("b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(relative_path(root, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn unreadable_local_target_is_not_treated_as_free() {
        assert!(matches!(existing_local(Ok(false)), LocalTarget::Free));
        assert!(matches!(existing_local(Ok(true)), LocalTarget::Exists));
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(existing_local(Err(denied)), LocalTarget::Unknown(_)));
    }

    #[test]
    fn collect_respects_recursion() {
        let dir = temp_dir();
        write_file(dir.path(), "top.txt", b"1");
        write_file(dir.path(), "sub/deep.txt", b"2");

        assert_eq!(collect_files(dir.path(), false).unwrap().len(), 1);
        assert_eq!(collect_files(dir.path(), true).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upload_directory_reports_existing_as_skipped() {
        let (session, _guard) = served_session().await;
        let source = temp_dir();
        let target = temp_dir();
        write_file(source.path(), "a.txt", b"new-a");
        write_file(source.path(), "nested/b.txt", b"new-b");
        write_file(target.path(), "a.txt", b"old-a");

        let target_str = target.path().to_string_lossy().into_owned();
        let report = upload_directory(&session, source.path(), &target_str, false, true)
            .await
            .unwrap();

        assert_eq!(report.transferred, 1);
        assert_eq!(report.skipped, vec!["a.txt".to_string()]);
        assert!(report.is_success());
        assert_eq!(std::fs::read(target.path().join("a.txt")).unwrap(), b"old-a");
        assert_eq!(std::fs::read(target.path().join("nested/b.txt")).unwrap(), b"new-b");
    }

    #[tokio::test]
    async fn download_directory_skips_subdirectories_unless_recursive() {
        let (session, _guard) = served_session().await;
        let source = temp_dir();
        write_file(source.path(), "one.txt", b"1");
        write_file(source.path(), "sub/two.txt", b"22");
        let source_str = source.path().to_string_lossy().into_owned();

        let flat = temp_dir();
        let report = download_directory(&session, &source_str, flat.path(), false, false)
            .await
            .unwrap();
        assert_eq!(report.transferred, 1);
        assert_eq!(report.skipped_directories.len(), 1);
        assert!(!flat.path().join("sub").exists());

        let deep = temp_dir();
        let report = download_directory(&session, &source_str, deep.path(), false, true)
            .await
            .unwrap();
        assert_eq!(report.transferred, 2);
        assert_eq!(std::fs::read(deep.path().join("sub/two.txt")).unwrap(), b"22");

        // Existing local files are kept without overwrite.
        let again = download_directory(&session, &source_str, deep.path(), false, true)
            .await
            .unwrap();
        assert_eq!(again.transferred, 0);
        assert_eq!(again.skipped.len(), 2);
    }

    #[tokio::test]
    async fn download_missing_directory_fails() {
        let (session, _guard) = served_session().await;
        let dir = temp_dir();
        let missing = dir.path().join("missing").to_string_lossy().into_owned();
        let err = download_directory(&session, &missing, &dir.path().join("out"), false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileTransfer { .. }));
    }
}
