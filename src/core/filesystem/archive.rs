// src/core/filesystem/archive.rs

//! Archive creation: compressing a set of paths inside a server root into
//! a tar.gz placed next to them.

use super::{Filesystem, FileInfo, usage};
use crate::core::errors::{HelmsmanError, Result};
use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};

impl Filesystem {
    /// Compresses `names` (files or directories, relative to `dir`) into a
    /// new `archive-<timestamp>.tar.gz` inside `dir`, returning the
    /// archive's metadata. The archive itself is charged against the
    /// quota, so the total size is checked before any byte is written.
    pub async fn compress_files(
        &self,
        dir: impl AsRef<Path>,
        names: &[String],
    ) -> Result<FileInfo> {
        let base = self.safe_path(dir.as_ref())?;

        let mut sources: Vec<(PathBuf, String)> = Vec::with_capacity(names.len());
        let mut total: u64 = 0;
        for name in names {
            let full = self.safe_path(dir.as_ref().join(name))?;
            self.is_ignored(&[&full])?;
            full.symlink_metadata().map_err(super::map_not_found)?;
            total += usage::path_size(&full);
            sources.push((full, name.clone()));
        }
        // Worst case the archive is as large as its inputs.
        self.has_space_for(total)?;

        let archive_name = format!("archive-{}.tar.gz", Utc::now().format("%Y-%m-%dT%H%M%S%.3f"));
        let archive_path = base.join(&archive_name);

        let build_path = archive_path.clone();
        tokio::task::spawn_blocking(move || build_tarball(&build_path, &sources))
            .await
            .map_err(|err| HelmsmanError::Internal(err.to_string()))??;

        self.chown_path(&archive_path)?;
        let written = archive_path.metadata().map(|m| m.len()).unwrap_or(0);
        self.add_usage(written as i64);

        self.stat(archive_path.strip_prefix(self.path()).unwrap_or(&archive_path))
    }
}

fn build_tarball(archive_path: &Path, sources: &[(PathBuf, String)]) -> Result<()> {
    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for (full, name) in sources {
        let metadata = full.symlink_metadata()?;
        if metadata.is_dir() {
            builder.append_dir_all(name, full)?;
        } else {
            builder.append_path_with_name(full, name)?;
        }
    }

    builder.into_inner()?.finish()?;
    Ok(())
}
