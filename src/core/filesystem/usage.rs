// src/core/filesystem/usage.rs

//! Live disk usage accounting for a server's data root. A single byte
//! counter is adjusted incrementally by writes and deletes, and corrected
//! by a periodic full walk of the tree.

use std::collections::HashSet;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Cached usage for one data root.
#[derive(Debug)]
pub struct UsageCache {
    /// Current estimate in bytes. Signed so that a burst of deletes racing
    /// a walk can momentarily undershoot without wrapping.
    bytes: AtomicI64,
    /// When the last successful full walk finished.
    last_walk: Mutex<Option<Instant>>,
    /// Serializes full walks; incremental adjustments do not take it.
    walk_guard: tokio::sync::Mutex<()>,
}

impl Default for UsageCache {
    fn default() -> Self {
        Self {
            bytes: AtomicI64::new(0),
            last_walk: Mutex::new(None),
            walk_guard: tokio::sync::Mutex::new(()),
        }
    }
}

impl UsageCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Current cached usage, clamped at zero.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire).max(0) as u64
    }

    /// Applies an incremental adjustment after a successful write or delete.
    pub fn add(&self, delta: i64) {
        self.bytes.fetch_add(delta, Ordering::AcqRel);
    }

    /// True when the cache has never been filled or the last walk is older
    /// than `threshold`.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        match *self.last_walk.lock() {
            Some(at) => at.elapsed() > threshold,
            None => true,
        }
    }

    /// Walks the tree and replaces the cached value. Concurrent callers
    /// coalesce onto one walk: whoever holds the guard does the work, the
    /// rest wait and then read the fresh value.
    pub async fn recompute(&self, root: &Path) -> u64 {
        let _guard = self.walk_guard.lock().await;

        let root = root.to_path_buf();
        let total = tokio::task::spawn_blocking(move || walk_tree_size(&root))
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "disk usage walk panicked");
                0
            });

        self.bytes.store(total as i64, Ordering::Release);
        *self.last_walk.lock() = Some(Instant::now());
        debug!(bytes = total, "disk usage recomputed");
        total
    }
}

/// Computes the byte size of everything below `root`.
///
/// Sockets are skipped, permission errors are tolerated, symlinks are not
/// followed, and a file hard-linked several times into the tree is counted
/// once per walk (keyed by device and inode).
pub fn walk_tree_size(root: &Path) -> u64 {
    let mut seen_inodes: HashSet<(u64, u64)> = HashSet::new();
    let mut total: u64 = 0;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry during usage walk");
                continue;
            }
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };

        let file_type = metadata.file_type();
        if !file_type.is_file() || file_type.is_socket() {
            continue;
        }

        if metadata.nlink() > 1 && !seen_inodes.insert((metadata.dev(), metadata.ino())) {
            continue;
        }

        total += metadata.len();
    }

    total
}

/// Computes the byte size of a single path: the file's size, or the sum of
/// the tree beneath a directory. A symlink counts as the link itself.
pub fn path_size(path: &Path) -> u64 {
    match path.symlink_metadata() {
        Ok(metadata) if metadata.file_type().is_symlink() => metadata.len(),
        Ok(metadata) if metadata.is_file() => metadata.len(),
        Ok(metadata) if metadata.is_dir() => walk_tree_size(path),
        _ => 0,
    }
}
