// src/core/filesystem/mod.rs

//! The quota-enforcing filesystem that underlies every server. All
//! operations are confined to the server's data root, checked against the
//! configured file denylist, and accounted against the disk quota.

use crate::config::SystemUser;
use crate::core::errors::{HelmsmanError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use wildmatch::WildMatch;

pub mod archive;
pub mod decompress;
pub mod path;
pub mod usage;

use usage::UsageCache;

/// Metadata returned for a single directory entry or stat call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Unix permission bits, e.g. `0o644`.
    pub mode: u32,
    /// Human form of the permission bits, e.g. `drwxr-xr-x`.
    pub mode_string: String,
    pub directory: bool,
    pub file: bool,
    pub symlink: bool,
    pub mime: String,
    pub modified: DateTime<Utc>,
}

impl FileInfo {
    fn from_metadata(name: String, metadata: &std::fs::Metadata) -> Self {
        let file_type = metadata.file_type();
        let mode = metadata.permissions().mode() & 0o7777;
        Self {
            name,
            size: metadata.len(),
            mode,
            mode_string: mode_string(mode, file_type.is_dir(), file_type.is_symlink()),
            directory: file_type.is_dir(),
            file: file_type.is_file(),
            symlink: file_type.is_symlink(),
            mime: if file_type.is_dir() {
                "inode/directory".to_string()
            } else {
                "application/octet-stream".to_string()
            },
            modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}

/// Renders permission bits in `ls -l` form.
fn mode_string(mode: u32, is_dir: bool, is_symlink: bool) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_dir {
        'd'
    } else if is_symlink {
        'l'
    } else {
        '-'
    });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// A server's private view of the disk: a root directory, a byte quota,
/// and a glob denylist. Owned exclusively by one server aggregate.
#[derive(Debug)]
pub struct Filesystem {
    root: PathBuf,
    /// Disk quota in bytes; 0 means unlimited.
    disk_limit: AtomicU64,
    /// Raw patterns plus their compiled matchers, swapped together on sync.
    denylist: RwLock<Vec<(String, WildMatch)>>,
    usage: UsageCache,
    owner: SystemUser,
    check_interval: Duration,
    stale_threshold: Duration,
}

impl Filesystem {
    /// Creates the filesystem for a data root, creating the directory when
    /// missing. The root is canonicalized once so that every later
    /// containment check compares resolved paths.
    pub fn new(
        root: impl Into<PathBuf>,
        disk_limit: u64,
        denylist: Vec<String>,
        owner: SystemUser,
        check_interval: Duration,
        stale_threshold: Duration,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;

        let fs = Self {
            root,
            disk_limit: AtomicU64::new(disk_limit),
            denylist: RwLock::new(compile_denylist(denylist)),
            usage: UsageCache::new(),
            owner,
            check_interval,
            stale_threshold,
        };
        fs.chown_path(&fs.root)?;
        Ok(fs)
    }

    /// The canonical data root.
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn limit(&self) -> u64 {
        self.disk_limit.load(Ordering::Acquire)
    }

    /// Applied on live reconfiguration when the panel changes build limits.
    pub fn set_limit(&self, limit: u64) {
        self.disk_limit.store(limit, Ordering::Release);
    }

    pub fn set_denylist(&self, patterns: Vec<String>) {
        *self.denylist.write() = compile_denylist(patterns);
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Resolves a user-supplied path, confined to the root.
    pub fn safe_path(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        path::safe_path(&self.root, rel.as_ref())
    }

    /// Resolves a path whose final component must be handled as-is (links
    /// are not followed at the leaf).
    pub fn safe_leaf_path(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        path::safe_leaf_path(&self.root, rel.as_ref())
    }

    // --- Denylist ---------------------------------------------------------

    /// Fails with the denylist kind when any given path matches a
    /// configured pattern. Patterns match against the root-relative path.
    pub fn is_ignored<P: AsRef<Path>>(&self, paths: &[P]) -> Result<()> {
        let denylist = self.denylist.read();
        if denylist.is_empty() {
            return Ok(());
        }
        for p in paths {
            let rel = self.relative_name(p.as_ref());
            if denylist.iter().any(|(_, matcher)| matcher.matches(&rel)) {
                return Err(HelmsmanError::DenylistFile { path: rel });
            }
        }
        Ok(())
    }

    fn relative_name(&self, p: &Path) -> String {
        p.strip_prefix(&self.root)
            .unwrap_or(p)
            .to_string_lossy()
            .trim_start_matches('/')
            .to_string()
    }

    // --- Quota ------------------------------------------------------------

    /// The latest cached usage in bytes.
    pub fn cached_usage(&self) -> u64 {
        self.usage.bytes()
    }

    /// Forces a full walk and returns the fresh total.
    pub async fn recompute_usage(&self) -> u64 {
        self.usage.recompute(&self.root).await
    }

    /// Whether the cached value is older than the stale threshold.
    pub fn usage_is_stale(&self) -> bool {
        self.usage.is_stale(self.stale_threshold)
    }

    /// True when the server is at or under its quota. With `refresh`, or
    /// when the cache has gone stale, a full walk runs first.
    pub async fn has_space_available(&self, refresh: bool) -> bool {
        let limit = self.limit();
        if limit == 0 {
            return true;
        }
        let usage = if refresh || self.usage_is_stale() {
            self.recompute_usage().await
        } else {
            self.cached_usage()
        };
        usage <= limit
    }

    /// Error-returning form of [`has_space_available`] for call chains.
    pub async fn has_space_err(&self, refresh: bool) -> Result<()> {
        if self.has_space_available(refresh).await {
            Ok(())
        } else {
            Err(HelmsmanError::DiskSpace)
        }
    }

    /// Pre-checks a write of known size against the quota.
    pub fn has_space_for(&self, size: u64) -> Result<()> {
        let limit = self.limit();
        if limit == 0 {
            return Ok(());
        }
        if self.cached_usage().saturating_add(size) > limit {
            return Err(HelmsmanError::DiskSpace);
        }
        Ok(())
    }

    /// Adjusts the cached usage after an out-of-band mutation (archives,
    /// downloads).
    pub fn add_usage(&self, delta: i64) {
        self.usage.add(delta);
    }

    // --- Read operations --------------------------------------------------

    pub fn stat(&self, rel: impl AsRef<Path>) -> Result<FileInfo> {
        let full = self.safe_path(rel.as_ref())?;
        let metadata = full.symlink_metadata().map_err(map_not_found)?;
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(FileInfo::from_metadata(name, &metadata))
    }

    /// Opens a file for reading, together with its metadata.
    pub async fn file(&self, rel: impl AsRef<Path>) -> Result<(tokio::fs::File, FileInfo)> {
        let full = self.safe_path(rel.as_ref())?;
        let metadata = full.metadata().map_err(map_not_found)?;
        if metadata.is_dir() {
            return Err(HelmsmanError::IsDirectory);
        }
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file = tokio::fs::File::open(&full).await?;
        Ok((file, FileInfo::from_metadata(name, &metadata)))
    }

    /// Lists a directory, directories first, then by name.
    pub fn list_directory(&self, rel: impl AsRef<Path>) -> Result<Vec<FileInfo>> {
        let full = self.safe_path(rel.as_ref())?;
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&full).map_err(map_not_found)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let Ok(metadata) = entry.path().symlink_metadata() else {
                continue;
            };
            out.push(FileInfo::from_metadata(
                entry.file_name().to_string_lossy().to_string(),
                &metadata,
            ));
        }
        out.sort_by(|a, b| {
            b.directory
                .cmp(&a.directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(out)
    }

    // --- Write operations -------------------------------------------------

    /// Streams `reader` into `rel`, replacing any existing file.
    ///
    /// The data lands in a temporary file inside the root first and is
    /// renamed into place, so a failed or over-quota write never leaves a
    /// partial file at the destination. Byte counting aborts the write the
    /// instant the quota would be exceeded.
    pub async fn write_file<R>(&self, rel: impl AsRef<Path>, mut reader: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let rel = rel.as_ref();
        let full = self.safe_path(rel)?;
        self.is_ignored(&[&full])?;

        if let Ok(metadata) = full.symlink_metadata() {
            if metadata.is_dir() {
                return Err(HelmsmanError::IsDirectory);
            }
        }
        let previous_size = full
            .symlink_metadata()
            .map(|m| m.len() as i64)
            .unwrap_or(0);

        let parent = full
            .parent()
            .ok_or_else(|| HelmsmanError::PathResolution {
                path: rel.to_path_buf(),
            })?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;
        self.chown_path(&parent)?;

        // Budget for this write: whatever remains under the quota plus the
        // bytes the file being replaced already occupies.
        let limit = self.limit();
        let budget = if limit == 0 {
            u64::MAX
        } else {
            limit
                .saturating_sub(self.cached_usage())
                .saturating_add(previous_size.max(0) as u64)
        };

        let temp = tempfile::NamedTempFile::new_in(&parent)?;
        let mut out = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(temp.path())
            .await?;

        let mut written: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > budget {
                // The temp file is unlinked when `temp` drops.
                return Err(HelmsmanError::DiskSpace);
            }
            out.write_all(&buf[..n]).await?;
        }
        out.flush().await?;
        drop(out);

        temp.persist(&full)
            .map_err(|err| HelmsmanError::Io(err.error))?;
        self.chown_path(&full)?;
        self.usage.add(written as i64 - previous_size);
        Ok(written)
    }

    /// Creates `name` (and missing parents) under `path`.
    pub async fn create_directory(&self, name: &str, rel: impl AsRef<Path>) -> Result<FileInfo> {
        let full = self.safe_path(rel.as_ref().join(name))?;
        tokio::fs::create_dir_all(&full).await?;
        self.chown_path(&full)?;
        self.stat(full.strip_prefix(&self.root).unwrap_or(&full))
    }

    /// Renames `from` to `to`. Both endpoints are denylist-checked, and an
    /// existing destination fails without touching either side.
    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let source = self.safe_leaf_path(from.as_ref())?;
        let dest = self.safe_leaf_path(to.as_ref())?;
        self.is_ignored(&[&source, &dest])?;

        if source == self.root {
            return Err(HelmsmanError::PathResolution {
                path: from.as_ref().to_path_buf(),
            });
        }
        source.symlink_metadata().map_err(map_not_found)?;
        if dest.symlink_metadata().is_ok() {
            return Err(HelmsmanError::AlreadyExists);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
            self.chown_path(parent)?;
        }
        tokio::fs::rename(&source, &dest).await?;
        Ok(())
    }

    /// Copies a file to a sibling `name copy.ext` (then `name copy 2.ext`
    /// and so on), charging the quota for the duplicate.
    pub async fn copy(&self, rel: impl AsRef<Path>) -> Result<FileInfo> {
        let source = self.safe_path(rel.as_ref())?;
        let metadata = source.metadata().map_err(map_not_found)?;
        if !metadata.is_file() {
            return Err(HelmsmanError::IsDirectory);
        }
        self.has_space_for(metadata.len())?;

        let parent = source.parent().unwrap_or(&self.root).to_path_buf();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut dest = parent.join(format!("{stem} copy{extension}"));
        let mut n = 2u32;
        while dest.symlink_metadata().is_ok() {
            dest = parent.join(format!("{stem} copy {n}{extension}"));
            n += 1;
        }

        tokio::fs::copy(&source, &dest).await?;
        self.chown_path(&dest)?;
        self.usage.add(metadata.len() as i64);
        self.stat(dest.strip_prefix(&self.root).unwrap_or(&dest))
    }

    /// Deletes a file or directory tree. Deleting a symlink removes only
    /// the link, never its target.
    pub async fn delete(&self, rel: impl AsRef<Path>) -> Result<()> {
        let full = self.safe_leaf_path(rel.as_ref())?;
        self.is_ignored(&[&full])?;

        let metadata = full.symlink_metadata().map_err(map_not_found)?;
        let removed = usage::path_size(&full);

        if metadata.is_dir() && !metadata.file_type().is_symlink() {
            tokio::fs::remove_dir_all(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        self.usage.add(-(removed as i64));
        Ok(())
    }

    /// Changes the permission bits on a path.
    pub async fn chmod(&self, rel: impl AsRef<Path>, mode: u32) -> Result<()> {
        let full = self.safe_path(rel.as_ref())?;
        self.is_ignored(&[&full])?;
        full.symlink_metadata().map_err(map_not_found)?;
        tokio::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    /// Recursively chowns a tree to the configured system user. Symlinks
    /// are re-owned as links; their targets, which may lie outside the
    /// root, are never followed.
    pub fn chown(&self, rel: impl AsRef<Path>) -> Result<()> {
        let full = self.safe_path(rel.as_ref())?;
        let uid = self.owner.uid;
        let gid = self.owner.gid;

        for entry in walkdir::WalkDir::new(&full).follow_links(false) {
            let Ok(entry) = entry else { continue };
            let result = if entry.path_is_symlink() {
                std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))
            } else {
                std::os::unix::fs::chown(entry.path(), Some(uid), Some(gid))
            };
            if let Err(err) = result {
                tracing::debug!(path = %entry.path().display(), error = %err, "chown failed");
            }
        }
        Ok(())
    }

    /// Chowns a single already-resolved path.
    pub(crate) fn chown_path(&self, path: &Path) -> Result<()> {
        if let Err(err) = std::os::unix::fs::lchown(path, Some(self.owner.uid), Some(self.owner.gid))
        {
            // Running unprivileged (tests, dev) is fine; ownership is a
            // production concern.
            if err.kind() != ErrorKind::PermissionDenied {
                return Err(err.into());
            }
        }
        Ok(())
    }
}

fn compile_denylist(patterns: Vec<String>) -> Vec<(String, WildMatch)> {
    patterns
        .into_iter()
        .map(|p| {
            let matcher = WildMatch::new(&p);
            (p, matcher)
        })
        .collect()
}

pub(crate) fn map_not_found(err: std::io::Error) -> HelmsmanError {
    if err.kind() == ErrorKind::NotFound {
        HelmsmanError::NotExist
    } else {
        HelmsmanError::Io(err)
    }
}
