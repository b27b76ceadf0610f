//! ============================================================================
//! Transport - HTTP access to the management server
//! ============================================================================
//! Task list GET, status update / registration POST, and payload downloads.
//! The sync engine only sees the `Transport` trait so tests can swap in a
//! scripted server.
//! ============================================================================

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::types::AgentError;

/// File name used when a URL has no usable last path segment
const FALLBACK_FILE_NAME: &str = "download";

/// Join a server path onto the configured base URL (one trailing slash stripped).
pub fn endpoint(base_url: &str, path: &str) -> String {
    let base = base_url.strip_suffix('/').unwrap_or(base_url);
    format!("{}/{}", base, path.trim_start_matches('/'))
}

/// Server and payload access used by the sync engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET a document as text
    async fn get_text(&self, url: &str) -> Result<String, AgentError>;

    /// POST a document. Returns true only on a transport-confirmed success.
    async fn post_document(&self, url: &str, body: String) -> bool;

    /// Fetch the resource at `url` fully into `dest_dir`, returning the file path
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, AgentError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_text(&self, url: &str) -> Result<String, AgentError> {
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::Network(format!("GET {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AgentError::Network(format!(
                "GET {} returned HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AgentError::Network(format!("Failed to read body of {}: {}", url, e)))
    }

    async fn post_document(&self, url: &str, body: String) -> bool {
        debug!("POST {} ({} bytes)", url, body.len());

        match self
            .client
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("POST {} returned HTTP {}", url, resp.status());
                false
            }
            Err(e) => {
                warn!("POST {} failed: {}", url, e);
                false
            }
        }
    }

    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, AgentError> {
        let file_name = file_name_for(url)?;
        let dest = dest_dir.join(&file_name);
        let partial = dest_dir.join(format!("{}.part", file_name));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::Network(format!("Download of {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AgentError::Network(format!(
                "Download of {} returned HTTP {}",
                url,
                response.status()
            )));
        }

        // Only a complete body ever appears under the final name
        let written = match write_body(url, response, &partial).await {
            Ok(written) => written,
            Err(e) => {
                discard_partial(&partial).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&partial, &dest).await {
            discard_partial(&partial).await;
            return Err(AgentError::Storage(format!(
                "Failed to move {}: {}",
                dest.display(),
                e
            )));
        }

        info!("Downloaded {} ({} bytes) to {}", url, written, dest.display());
        Ok(dest)
    }
}

/// Stream the response body into `partial`, returning the byte count
async fn write_body(
    url: &str,
    mut response: reqwest::Response,
    partial: &Path,
) -> Result<u64, AgentError> {
    let storage_err =
        |e: std::io::Error| AgentError::Storage(format!("Failed to write {}: {}", partial.display(), e));

    let mut file = tokio::fs::File::create(partial).await.map_err(storage_err)?;
    let mut written = 0u64;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| AgentError::Network(format!("Download of {} interrupted: {}", url, e)))?
    {
        file.write_all(&chunk).await.map_err(storage_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(storage_err)?;

    Ok(written)
}

async fn discard_partial(partial: &Path) {
    if let Err(e) = tokio::fs::remove_file(partial).await {
        debug!("No partial download to remove at {}: {}", partial.display(), e);
    }
}

/// Local file name for a payload URL: its last path segment.
pub fn file_name_for(url: &str) -> Result<String, AgentError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AgentError::Network(format!("Invalid URL {}: {}", url, e)))?;

    let name = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .filter(|s| *s != "." && *s != "..")
        .unwrap_or(FALLBACK_FILE_NAME);

    Ok(name.to_string())
}
