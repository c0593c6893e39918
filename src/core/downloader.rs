// src/core/downloader.rs

//! Tracked remote downloads into server roots. Every job is indexed by
//! its own UUID and by the owning server, capped per server, and guarded
//! against requests that resolve to internal addresses.

use crate::core::errors::{HelmsmanError, Result};
use crate::core::metrics;
use crate::core::server::Server;
use dashmap::DashMap;
use futures::TryStreamExt;
use reqwest::redirect;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;
use uuid::Uuid;

/// Concurrent download jobs allowed per server.
const MAX_PER_SERVER: usize = 3;

/// One remote-fetch job.
#[derive(Debug)]
pub struct Download {
    pub uuid: Uuid,
    pub server: Uuid,
    /// Destination directory, relative to the server root.
    pub directory: PathBuf,
    pub url: Url,
    /// Progress in [0,1], stored as f64 bits.
    progress: AtomicU64,
    /// Total size when the origin advertises one.
    pub content_length: Option<u64>,
    token: CancellationToken,
}

impl Download {
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    fn set_progress(&self, value: f64) {
        self.progress
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// The process-wide registry of download jobs.
#[derive(Debug, Default)]
pub struct DownloadManager {
    by_id: DashMap<Uuid, Arc<Download>>,
    by_server: DashMap<Uuid, Vec<Uuid>>,
}

impl DownloadManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a new job, enforcing the per-server cap.
    pub fn track(&self, server: Uuid, directory: PathBuf, url: Url) -> Result<Arc<Download>> {
        let mut ids = self.by_server.entry(server).or_default();
        if ids.len() >= MAX_PER_SERVER {
            return Err(HelmsmanError::DownloadLimit);
        }

        let download = Arc::new(Download {
            uuid: Uuid::new_v4(),
            server,
            directory,
            url,
            progress: AtomicU64::new(0f64.to_bits()),
            content_length: None,
            token: CancellationToken::new(),
        });
        ids.push(download.uuid);
        self.by_id.insert(download.uuid, download.clone());
        Ok(download)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Download>> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    pub fn for_server(&self, server: Uuid) -> Vec<Arc<Download>> {
        self.by_server
            .get(&server)
            .map(|ids| ids.iter().filter_map(|id| self.get(*id)).collect())
            .unwrap_or_default()
    }

    /// Cancels and forgets a single job.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.remove(id) {
            Some(download) => {
                download.cancel();
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: Uuid) -> Option<Arc<Download>> {
        let (_, download) = self.by_id.remove(&id)?;
        if let Some(mut ids) = self.by_server.get_mut(&download.server) {
            ids.retain(|other| *other != id);
        }
        Some(download)
    }

    /// Runs a job to completion: resolves and vets the origin address,
    /// streams the body into the server's filesystem under its quota,
    /// and updates progress as bytes arrive. The job is deregistered on
    /// every exit path.
    pub async fn execute(&self, download: Arc<Download>, server: &Arc<Server>) -> Result<()> {
        metrics::DOWNLOADS_IN_FLIGHT.inc();
        let result = self.execute_inner(&download, server).await;
        metrics::DOWNLOADS_IN_FLIGHT.dec();
        self.remove(download.uuid);
        result
    }

    async fn execute_inner(&self, download: &Arc<Download>, server: &Arc<Server>) -> Result<()> {
        check_destination(&download.url).await?;

        // Redirects are refused outright; a vetted address must not be
        // allowed to bounce the request somewhere unvetted.
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| HelmsmanError::DownloadFailed(err.to_string()))?;

        let response = client
            .get(download.url.clone())
            .send()
            .await
            .map_err(|err| HelmsmanError::DownloadFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(HelmsmanError::DownloadFailed(format!(
                "unexpected response status: {}",
                response.status()
            )));
        }

        let total = response.content_length();
        if let Some(total) = total {
            server.filesystem().has_space_for(total)?;
        }

        let filename = download
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("download")
            .to_string();
        let dest = download.directory.join(filename);

        info!(
            server = %download.server,
            url = %download.url,
            file = %dest.display(),
            "downloading remote file"
        );

        let progress_target = download.clone();
        let received = Arc::new(AtomicU64::new(0));
        let counter = received.clone();
        let stream = response
            .bytes_stream()
            .inspect_ok(move |chunk| {
                let seen = counter.fetch_add(chunk.len() as u64, Ordering::AcqRel)
                    + chunk.len() as u64;
                if let Some(total) = total.filter(|t| *t > 0) {
                    progress_target.set_progress(seen as f64 / total as f64);
                }
            })
            .map_err(std::io::Error::other);
        let reader = tokio_util::io::StreamReader::new(stream);

        tokio::select! {
            result = server.filesystem().write_file(&dest, reader) => {
                result?;
                download.set_progress(1.0);
                Ok(())
            }
            _ = download.token.cancelled() => {
                Err(HelmsmanError::DownloadFailed("download cancelled".to_string()))
            }
        }
    }
}

/// Resolves the URL's host and rejects any address a tenant could use to
/// reach the node itself or its private networks.
async fn check_destination(url: &Url) -> Result<()> {
    let Some(host) = url.host_str() else {
        return Err(HelmsmanError::InternalResolution);
    };
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| HelmsmanError::InternalResolution)?
        .collect();
    if addrs.is_empty() {
        return Err(HelmsmanError::InternalResolution);
    }

    for addr in addrs {
        if is_forbidden_ip(addr.ip()) {
            return Err(HelmsmanError::InvalidIpAddress);
        }
    }
    Ok(())
}

/// Loopback, link-local, unspecified, RFC1918, and IPv6 ULA ranges.
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_link_local() || v4.is_private() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}
