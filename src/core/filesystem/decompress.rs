// src/core/filesystem/decompress.rs

//! Archive extraction with root confinement, denylist enforcement, and
//! quota budgeting. Extraction runs in two phases: every entry is
//! validated before the first byte is written, and a failure mid-extract
//! removes whatever was already unpacked.

use super::{Filesystem, path as safe};
use crate::core::errors::{HelmsmanError, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{Read, Seek};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use wildmatch::WildMatch;

/// The archive formats the agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

fn sniff_format(name: &str) -> Result<ArchiveFormat> {
    let lower = name.to_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Ok(ArchiveFormat::TarGz)
    } else if lower.ends_with(".tar") {
        Ok(ArchiveFormat::Tar)
    } else if lower.ends_with(".zip") {
        Ok(ArchiveFormat::Zip)
    } else {
        Err(HelmsmanError::UnknownArchive)
    }
}

impl Filesystem {
    /// Returns the number of bytes the archive would extract to, after
    /// confirming that amount fits under the quota.
    pub async fn space_available_for_decompression(
        &self,
        dir: impl AsRef<Path>,
        file: &str,
    ) -> Result<u64> {
        let plan = self.plan_decompression(dir.as_ref(), file).await?;
        Ok(plan.total_size)
    }

    /// Extracts an archive into `dir`. Entry paths are confined to the
    /// server root, denylisted targets are rejected, mode bits are
    /// preserved, and the whole operation aborts before writing anything
    /// when any entry would escape or the quota would be exceeded.
    pub async fn decompress_file(&self, dir: impl AsRef<Path>, file: &str) -> Result<()> {
        let dir = dir.as_ref();
        let plan = self.plan_decompression(dir, file).await?;

        let root = self.path().to_path_buf();
        let total = tokio::task::spawn_blocking(move || extract_archive(&plan, &root))
            .await
            .map_err(|err| HelmsmanError::Internal(err.to_string()))??;

        self.chown(dir)?;
        self.add_usage(total as i64);
        Ok(())
    }

    /// Validates every entry of the archive and computes the extraction
    /// budget. Nothing is written.
    async fn plan_decompression(&self, dir: &Path, file: &str) -> Result<DecompressionPlan> {
        let archive_path = self.safe_path(dir.join(file))?;
        archive_path.symlink_metadata().map_err(super::map_not_found)?;
        let format = sniff_format(file)?;

        let base_rel = strip_root(self.path(), &self.safe_path(dir)?);
        let denylist: Vec<String> = {
            let guard = self.denylist.read();
            guard.iter().map(|(p, _)| p.clone()).collect()
        };

        let root = self.path().to_path_buf();
        let scan_path = archive_path.clone();
        let scan_base = base_rel.clone();
        let total_size = tokio::task::spawn_blocking(move || {
            scan_entries(&scan_path, format, &root, &scan_base, &denylist)
        })
        .await
        .map_err(|err| HelmsmanError::Internal(err.to_string()))??;

        self.has_space_for(total_size)?;

        Ok(DecompressionPlan {
            archive_path,
            format,
            base_rel,
            total_size,
        })
    }
}

#[derive(Debug)]
struct DecompressionPlan {
    archive_path: PathBuf,
    format: ArchiveFormat,
    /// Destination directory, relative to the server root.
    base_rel: PathBuf,
    total_size: u64,
}

fn strip_root(root: &Path, full: &Path) -> PathBuf {
    full.strip_prefix(root).unwrap_or(full).to_path_buf()
}

/// Rejects entry names that are absolute or whose `..` components would
/// climb out of the destination.
fn confined_entry_path(base_rel: &Path, entry: &Path) -> Result<PathBuf> {
    let mut depth: i32 = 0;
    for component in entry.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(HelmsmanError::PathResolution {
                        path: entry.to_path_buf(),
                    });
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(HelmsmanError::PathResolution {
                    path: entry.to_path_buf(),
                });
            }
        }
    }
    Ok(base_rel.join(entry))
}

fn is_denylisted(denylist: &[String], rel: &Path) -> bool {
    if denylist.is_empty() {
        return false;
    }
    let name = rel.to_string_lossy();
    let name = name.trim_start_matches('/');
    denylist.iter().any(|p| WildMatch::new(p).matches(name))
}

/// Phase one: walk every entry, confining its path and summing its size.
fn scan_entries(
    archive: &Path,
    format: ArchiveFormat,
    root: &Path,
    base_rel: &Path,
    denylist: &[String],
) -> Result<u64> {
    let mut total: u64 = 0;
    let mut check = |entry_path: &Path, size: u64| -> Result<()> {
        let rel = confined_entry_path(base_rel, entry_path)?;
        // Resolve against the live tree as well; an entry targeting an
        // existing out-of-root symlink is caught here.
        safe::safe_path(root, &rel)?;
        if is_denylisted(denylist, &rel) {
            return Err(HelmsmanError::DenylistFile {
                path: rel.to_string_lossy().to_string(),
            });
        }
        total += size;
        Ok(())
    };

    match format {
        ArchiveFormat::Tar => {
            let file = File::open(archive)?;
            scan_tar(tar::Archive::new(file), &mut check)?;
        }
        ArchiveFormat::TarGz => {
            let file = File::open(archive)?;
            scan_tar(tar::Archive::new(GzDecoder::new(file)), &mut check)?;
        }
        ArchiveFormat::Zip => {
            let file = File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file).map_err(zip_error)?;
            for i in 0..zip.len() {
                let entry = zip.by_index(i).map_err(zip_error)?;
                let Some(name) = entry.enclosed_name() else {
                    return Err(HelmsmanError::PathResolution {
                        path: PathBuf::from(entry.name()),
                    });
                };
                check(&name, entry.size())?;
            }
        }
    }
    Ok(total)
}

fn scan_tar<R: Read>(
    mut archive: tar::Archive<R>,
    check: &mut dyn FnMut(&Path, u64) -> Result<()>,
) -> Result<()> {
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.to_path_buf();
        check(&path, entry.size())?;
    }
    Ok(())
}

/// Phase two: unpack. Every file write re-resolves its destination so a
/// symlink unpacked earlier in this same archive cannot redirect a later
/// entry outside the root. On error, everything written so far is removed.
fn extract_archive(plan: &DecompressionPlan, root: &Path) -> Result<u64> {
    let mut written: Vec<PathBuf> = Vec::new();
    let result = extract_inner(plan, root, &mut written);

    if result.is_err() {
        // Unwind in reverse creation order so files go before their
        // directories.
        for path in written.iter().rev() {
            let _ = if path.is_dir() {
                std::fs::remove_dir(path)
            } else {
                std::fs::remove_file(path)
            };
        }
    }
    result
}

fn extract_inner(plan: &DecompressionPlan, root: &Path, written: &mut Vec<PathBuf>) -> Result<u64> {
    let mut total: u64 = 0;

    match plan.format {
        ArchiveFormat::Tar => {
            let file = File::open(&plan.archive_path)?;
            extract_tar(tar::Archive::new(file), plan, root, written, &mut total)?;
        }
        ArchiveFormat::TarGz => {
            let file = File::open(&plan.archive_path)?;
            extract_tar(
                tar::Archive::new(GzDecoder::new(file)),
                plan,
                root,
                written,
                &mut total,
            )?;
        }
        ArchiveFormat::Zip => {
            let file = File::open(&plan.archive_path)?;
            extract_zip(file, plan, root, written, &mut total)?;
        }
    }
    Ok(total)
}

fn extract_tar<R: Read>(
    mut archive: tar::Archive<R>,
    plan: &DecompressionPlan,
    root: &Path,
    written: &mut Vec<PathBuf>,
    total: &mut u64,
) -> Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = confined_entry_path(&plan.base_rel, &entry.path()?.to_path_buf())?;
        let dest = safe::safe_path(root, &rel)?;
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                if !dest.is_dir() {
                    std::fs::create_dir_all(&dest)?;
                    written.push(dest.clone());
                }
                set_mode(&dest, mode);
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                if let Some(target) = entry.link_name()? {
                    let _ = std::fs::remove_file(&dest);
                    std::os::unix::fs::symlink(target, &dest)?;
                    written.push(dest.clone());
                }
            }
            tar::EntryType::Regular | tar::EntryType::GNUSparse => {
                *total += write_entry(&dest, &mut entry, mode, written)?;
            }
            // Character devices, fifos and friends have no business in a
            // server data root.
            _ => {}
        }
    }
    Ok(())
}

fn extract_zip<R: Read + Seek>(
    reader: R,
    plan: &DecompressionPlan,
    root: &Path,
    written: &mut Vec<PathBuf>,
    total: &mut u64,
) -> Result<()> {
    let mut zip = zip::ZipArchive::new(reader).map_err(zip_error)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_error)?;
        let Some(name) = entry.enclosed_name() else {
            return Err(HelmsmanError::PathResolution {
                path: PathBuf::from(entry.name()),
            });
        };
        let rel = confined_entry_path(&plan.base_rel, &name)?;
        let dest = safe::safe_path(root, &rel)?;
        let mode = entry.unix_mode().unwrap_or(0o644);

        if entry.is_dir() {
            if !dest.is_dir() {
                std::fs::create_dir_all(&dest)?;
                written.push(dest.clone());
            }
            set_mode(&dest, mode);
        } else {
            *total += write_entry(&dest, &mut entry, mode, written)?;
        }
    }
    Ok(())
}

fn write_entry<R: Read>(
    dest: &Path,
    reader: &mut R,
    mode: u32,
    written: &mut Vec<PathBuf>,
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        if !parent.is_dir() {
            std::fs::create_dir_all(parent)?;
            written.push(parent.to_path_buf());
        }
    }
    let mut out = File::create(dest)?;
    written.push(dest.to_path_buf());
    let copied = std::io::copy(reader, &mut out)?;
    set_mode(dest, mode);
    Ok(copied)
}

fn set_mode(path: &Path, mode: u32) {
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777));
}

fn zip_error(err: zip::result::ZipError) -> HelmsmanError {
    match err {
        zip::result::ZipError::Io(io) => HelmsmanError::Io(io),
        _ => HelmsmanError::UnknownArchive,
    }
}
