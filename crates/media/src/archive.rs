//! Move downloaded files from the temp root into the dated inbound
//! archive, and prune entries past their retention window.

use std::path::{Path, PathBuf};

use {
    chrono::{Local, Utc},
    tracing::{debug, warn},
};

use crate::error::Result;

/// Archive layout: `<media_root>/inbound/YYYY-MM-DD/<file>`.
pub struct MediaArchive {
    temp_root: PathBuf,
    media_root: PathBuf,
    keep_days: u32,
}

impl MediaArchive {
    pub fn new(
        temp_root: impl Into<PathBuf>,
        media_root: impl Into<PathBuf>,
        keep_days: u32,
    ) -> Result<Self> {
        let media_root = media_root.into();
        std::fs::create_dir_all(media_root.join("inbound"))?;
        Ok(Self {
            temp_root: temp_root.into(),
            media_root,
            keep_days,
        })
    }

    #[must_use]
    pub fn inbound_root(&self) -> PathBuf {
        self.media_root.join("inbound")
    }

    /// Move a temp file into today's inbound directory and return the new
    /// absolute path.
    ///
    /// Only files inside the temp root are moved; anything else is
    /// returned unchanged. A failed rename falls back to best-effort
    /// delete plus returning the temp path, so callers always get a path
    /// that existed at some point.
    pub async fn archive(&self, path: &Path) -> PathBuf {
        if !path.starts_with(&self.temp_root) {
            return path.to_path_buf();
        }
        let Some(file_name) = path.file_name() else {
            return path.to_path_buf();
        };

        let day_dir = self
            .inbound_root()
            .join(Local::now().format("%Y-%m-%d").to_string());
        if let Err(error) = tokio::fs::create_dir_all(&day_dir).await {
            warn!(error = %error, "inbound archive dir creation failed");
            let _ = tokio::fs::remove_file(path).await;
            return path.to_path_buf();
        }

        let target = day_dir.join(file_name);
        match tokio::fs::rename(path, &target).await {
            Ok(()) => {
                debug!(from = %path.display(), to = %target.display(), "media archived");
                target
            },
            Err(error) => {
                warn!(error = %error, "media archive rename failed");
                let _ = tokio::fs::remove_file(path).await;
                path.to_path_buf()
            },
        }
    }

    /// Lazy retention pass; see [`prune_inbound`].
    pub async fn prune(&self) {
        prune_inbound(&self.inbound_root(), self.keep_days).await;
    }
}

/// Delete archived files older than `keep_days`.
///
/// For each date-named subdirectory whose mtime is past the cutoff,
/// files inside with an mtime also past the cutoff are removed.
/// Non-conforming entries are left alone, and young files are never
/// touched even in old directories.
pub async fn prune_inbound(inbound_root: &Path, keep_days: u32) {
    let cutoff = Utc::now().timestamp() - i64::from(keep_days) * 24 * 3600;

    let Ok(mut dirs) = tokio::fs::read_dir(inbound_root).await else {
        return;
    };
    while let Ok(Some(entry)) = dirs.next_entry().await {
        let dir_path = entry.path();
        if !dir_path.is_dir() || !is_date_dir_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        if mtime_unix(&dir_path).await.is_none_or(|m| m > cutoff) {
            continue;
        }

        let Ok(mut files) = tokio::fs::read_dir(&dir_path).await else {
            continue;
        };
        let mut removed = 0usize;
        while let Ok(Some(file)) = files.next_entry().await {
            let file_path = file.path();
            if !file_path.is_file() {
                continue;
            }
            if mtime_unix(&file_path).await.is_some_and(|m| m <= cutoff) {
                if tokio::fs::remove_file(&file_path).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(dir = %dir_path.display(), removed, "pruned inbound media");
        }
        // remove the day directory when it emptied out
        let _ = tokio::fs::remove_dir(&dir_path).await;
    }
}

fn is_date_dir_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

async fn mtime_unix(path: &Path) -> Option<i64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let mtime = meta.modified().ok()?;
    mtime
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn archive_moves_temp_files_into_dated_dir() {
        let root = tempfile::tempdir().unwrap();
        let temp = root.path().join("tmp");
        std::fs::create_dir_all(&temp).unwrap();
        let media = root.path().join("media");
        let archive = MediaArchive::new(&temp, &media, 7).unwrap();

        let source = temp.join("img_1_abc.jpg");
        tokio::fs::write(&source, b"x").await.unwrap();

        let archived = archive.archive(&source).await;
        assert!(archived.starts_with(media.join("inbound")));
        let day = archived.parent().unwrap().file_name().unwrap();
        assert!(is_date_dir_name(&day.to_string_lossy()));
        assert_eq!(archived.file_name().unwrap(), "img_1_abc.jpg");
        assert!(!source.exists());
        assert!(archived.exists());
    }

    #[tokio::test]
    async fn archive_refuses_paths_outside_temp_root() {
        let root = tempfile::tempdir().unwrap();
        let temp = root.path().join("tmp");
        std::fs::create_dir_all(&temp).unwrap();
        let archive = MediaArchive::new(&temp, root.path().join("media"), 7).unwrap();

        let outside = root.path().join("elsewhere.jpg");
        tokio::fs::write(&outside, b"x").await.unwrap();
        let result = archive.archive(&outside).await;
        assert_eq!(result, outside);
        assert!(outside.exists(), "file outside temp root is not touched");
    }

    #[tokio::test]
    async fn prune_removes_only_old_files_in_old_date_dirs() {
        let root = tempfile::tempdir().unwrap();
        let inbound = root.path().join("inbound");
        let old_dir = inbound.join("2020-01-01");
        std::fs::create_dir_all(&old_dir).unwrap();
        let old_file = old_dir.join("img_old.jpg");
        std::fs::write(&old_file, b"x").unwrap();
        // backdate mtimes past any reasonable cutoff
        let past = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_577_836_800);
        set_mtime(&old_file, past);
        set_mtime(&old_dir, past);

        let fresh_dir = inbound.join("2099-01-01");
        std::fs::create_dir_all(&fresh_dir).unwrap();
        let fresh_file = fresh_dir.join("img_new.jpg");
        std::fs::write(&fresh_file, b"x").unwrap();

        let stray = inbound.join("not-a-date");
        std::fs::create_dir_all(&stray).unwrap();
        let stray_file = stray.join("keep.bin");
        std::fs::write(&stray_file, b"x").unwrap();
        set_mtime(&stray, past);

        prune_inbound(&inbound, 7).await;

        assert!(!old_file.exists(), "old file pruned");
        assert!(!old_dir.exists(), "emptied day dir removed");
        assert!(fresh_file.exists(), "fresh dir untouched");
        assert!(stray_file.exists(), "non-conforming dir untouched");
    }

    fn set_mtime(path: &Path, to: std::time::SystemTime) {
        let file = std::fs::File::options()
            .write(true)
            .open(path)
            .or_else(|_| std::fs::File::open(path))
            .unwrap();
        file.set_times(
            std::fs::FileTimes::new().set_accessed(to).set_modified(to),
        )
        .unwrap();
    }
}
