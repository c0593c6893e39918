// src/core/remote/client.rs

//! The HTTP implementation of the panel contract. Network failures and
//! server errors are retried with exponential backoff; authentication
//! and rate-limit responses are terminal.

use super::PanelClient;
use crate::core::errors::{HelmsmanError, Result};
use crate::core::server::ServerConfiguration;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Retries per request before giving up.
const MAX_ATTEMPTS: u32 = 4;

/// Base delay for the exponential backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct PagedServers {
    data: Vec<ServerConfiguration>,
    meta: PageMeta,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    current_page: usize,
    last_page: usize,
}

#[derive(Debug, Deserialize)]
struct UploadUrls {
    parts: Vec<String>,
}

/// Talks to the panel's node API using the node credential pair.
#[derive(Debug, Clone)]
pub struct PanelHttpClient {
    http: Client,
    base: String,
    token: String,
}

impl PanelHttpClient {
    pub fn new(base: &str, token_id: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("helmsman/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| HelmsmanError::Remote(err.to_string()))?;

        Ok(Self {
            http,
            base: format!("{}/api/remote", base.trim_end_matches('/')),
            token: format!("{token_id}.{token}"),
        })
    }

    /// Issues a request, retrying transient failures. 401/403/429 are
    /// never retried; anything else non-2xx is surfaced after the last
    /// attempt.
    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let mut last_error = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = BACKOFF_BASE * 2u32.pow(attempt - 1);
                debug!(%url, attempt, "retrying panel request after backoff");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .header("Accept", "application/json");
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .map_err(|err| HelmsmanError::Remote(err.to_string()));
                    }
                    if matches!(
                        status,
                        StatusCode::UNAUTHORIZED
                            | StatusCode::FORBIDDEN
                            | StatusCode::TOO_MANY_REQUESTS
                    ) {
                        return Err(HelmsmanError::Remote(format!(
                            "panel rejected request to {path}: {status}"
                        )));
                    }
                    last_error = format!("unexpected response status: {status}");
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }
        }

        warn!(%url, error = %last_error, "panel request failed after retries");
        Err(HelmsmanError::Remote(last_error))
    }
}

#[async_trait]
impl PanelClient for PanelHttpClient {
    async fn get_server_configuration(&self, uuid: Uuid) -> Result<ServerConfiguration> {
        self.request(Method::GET, &format!("/servers/{uuid}"), None)
            .await
    }

    async fn get_servers(&self, per_page: usize) -> Result<Vec<ServerConfiguration>> {
        let mut servers = Vec::new();
        let mut page = 1usize;
        loop {
            let response: PagedServers = self
                .request(
                    Method::GET,
                    &format!("/servers?page={page}&per_page={per_page}"),
                    None,
                )
                .await?;
            servers.extend(response.data);
            if response.meta.current_page >= response.meta.last_page {
                return Ok(servers);
            }
            page = response.meta.current_page + 1;
        }
    }

    async fn set_installation_status(&self, uuid: Uuid, successful: bool) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                &format!("/servers/{uuid}/install"),
                Some(json!({ "successful": successful })),
            )
            .await?;
        Ok(())
    }

    async fn set_archive_status(&self, uuid: Uuid, successful: bool) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                &format!("/servers/{uuid}/archive"),
                Some(json!({ "successful": successful })),
            )
            .await?;
        Ok(())
    }

    async fn set_transfer_status(&self, uuid: Uuid, successful: bool) -> Result<()> {
        let state = if successful { "success" } else { "failure" };
        let _: serde_json::Value = self
            .request(
                Method::POST,
                &format!("/servers/{uuid}/transfer/{state}"),
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_backup_remote_upload_urls(&self, backup: Uuid, size: u64) -> Result<Vec<String>> {
        let response: UploadUrls = self
            .request(
                Method::GET,
                &format!("/backups/{backup}?size={size}"),
                None,
            )
            .await?;
        Ok(response.parts)
    }
}
