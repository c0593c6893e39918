// src/core/backup/mod.rs

//! Local backups: tar.gz archives of a server's data root kept in the
//! node's backup directory, keyed by backup UUID.

use crate::core::errors::{HelmsmanError, Result};
use crate::core::events::topic;
use crate::core::filesystem::path as safe_path;
use crate::core::server::Server;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// What the signed-download endpoint needs to serve a backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub uuid: Uuid,
    pub path: PathBuf,
    pub size: u64,
    pub mimetype: &'static str,
}

/// Manages the node-local backup directory.
#[derive(Debug)]
pub struct BackupManager {
    directory: PathBuf,
}

impl BackupManager {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    fn archive_path(&self, uuid: Uuid) -> PathBuf {
        self.directory.join(format!("{uuid}.tar.gz"))
    }

    /// Finds a backup on disk by UUID.
    pub fn locate(&self, uuid: Uuid) -> Result<BackupInfo> {
        let path = self.archive_path(uuid);
        let metadata = path.metadata().map_err(|_| HelmsmanError::NotExist)?;
        Ok(BackupInfo {
            uuid,
            path,
            size: metadata.len(),
            mimetype: "application/gzip",
        })
    }

    /// Archives the server's data root into `<uuid>.tar.gz`, announcing
    /// completion (with a checksum) on the server's bus.
    pub async fn create(&self, server: &Arc<Server>, uuid: Uuid) -> Result<BackupInfo> {
        let source = server.filesystem().path().to_path_buf();
        let dest = self.archive_path(uuid);

        let build_dest = dest.clone();
        let checksum = tokio::task::spawn_blocking(move || -> Result<String> {
            let file = File::create(&build_dest)?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(false);
            builder.append_dir_all(".", &source)?;
            builder.into_inner()?.finish()?;
            sha256_file(&build_dest)
        })
        .await
        .map_err(|err| HelmsmanError::Internal(err.to_string()))??;

        let info = self.locate(uuid)?;
        info!(server = %server.uuid(), backup = %uuid, size = info.size, "backup created");
        server.events().publish(
            topic::BACKUP_COMPLETED,
            json!({
                "uuid": uuid,
                "is_successful": true,
                "checksum": checksum,
                "checksum_type": "sha256",
                "file_size": info.size,
            }),
        );
        Ok(info)
    }

    /// Unpacks a backup over the server's data root. Entry paths are
    /// confined exactly like user-driven decompression.
    pub async fn restore(&self, server: &Arc<Server>, uuid: Uuid) -> Result<()> {
        let info = self.locate(uuid)?;
        let root = server.filesystem().path().to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = File::open(&info.path)?;
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            archive.set_preserve_permissions(true);
            for entry in archive.entries()? {
                let mut entry = entry?;
                let rel = entry.path()?.to_path_buf();
                let dest = safe_path::safe_path(&root, &rel)?;
                if entry.header().entry_type().is_dir() {
                    std::fs::create_dir_all(&dest)?;
                    continue;
                }
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest)?;
            }
            Ok(())
        })
        .await
        .map_err(|err| HelmsmanError::Internal(err.to_string()))??;

        server.filesystem().chown("")?;
        server.filesystem().recompute_usage().await;
        info!(server = %server.uuid(), backup = %uuid, "backup restored");
        Ok(())
    }

    /// Removes a backup archive; removing one that is already gone is
    /// not an error.
    pub fn delete(&self, uuid: Uuid) -> Result<()> {
        match std::fs::remove_file(self.archive_path(uuid)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
