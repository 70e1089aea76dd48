//! HTTP transport for the remote store.
//!
//! This module provides:
//! - Remote config fetch at engine init
//! - Batch upload with exactly one attempt per batch (no retry, no backoff)
//! - Bounding-box cell queries for display layers
//!
//! Uploads are authenticated with a bearer token supplied by the host.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use log::{debug, info, warn};
use reqwest::Client;

use crate::config::{ConfigSource, RemoteConfig};
use crate::store::CellSummary;
use crate::upload::{BatchSink, PendingBatch};
use crate::{Bounds, ConfigLoadError, Error, UploadError};

// Uploads are fire-and-forget from the flush loop, but a hung request still
// holds a connection, so cap it well under the default flush interval.
const REQUEST_TIMEOUT_SECS: u64 = 20;

/// Endpoint layout of the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    /// Default: "/api/pulse/config"
    pub config_path: String,
    /// Default: "/api/pulse/batch"
    pub upload_path: String,
    /// Default: "/api/pulse/cells"
    pub cells_path: String,
    pub timeout: Duration,
}

impl HttpRemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config_path: "/api/pulse/config".to_string(),
            upload_path: "/api/pulse/batch".to_string(),
            cells_path: "/api/pulse/cells".to_string(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Client for the remote config, upload and cell query endpoints.
pub struct HttpRemote {
    client: Client,
    config: HttpRemoteConfig,
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, Error> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Client(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpRemoteConfig {
        &self.config
    }

    async fn fetch_config(&self) -> Result<RemoteConfig, ConfigLoadError> {
        let url = self.config.url(&self.config.config_path);
        let start = Instant::now();

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ConfigLoadError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ConfigLoadError::Status(status.as_u16()));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ConfigLoadError::Unreachable(format!("body download error: {}", e)))?;
        let remote = RemoteConfig::from_json(&body)?;

        info!("[HttpRemote] config loaded in {:?}", start.elapsed());
        Ok(remote)
    }

    async fn post_batch(&self, token: &str, batch: &PendingBatch) -> Result<(), UploadError> {
        let url = self.config.url(&self.config.upload_path);
        let body = batch.to_json()?;
        let body_size = body.len();
        let start = Instant::now();

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }

        debug!(
            "[HttpRemote] uploaded {} cells ({:.1}KB) in {:?}",
            batch.len(),
            body_size as f64 / 1024.0,
            start.elapsed()
        );
        Ok(())
    }

    /// Aggregated cells whose center lies inside `bounds`.
    pub async fn query_cells(&self, bounds: &Bounds, token: &str) -> Result<Vec<CellSummary>, Error> {
        let url = self.config.url(&self.config.cells_path);

        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[
                ("minLat", bounds.min_lat),
                ("maxLat", bounds.max_lat),
                ("minLng", bounds.min_lng),
                ("maxLng", bounds.max_lng),
            ])
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            warn!("[HttpRemote] cell query failed: HTTP {}", status);
            return Err(UploadError::Status(status.as_u16()).into());
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| UploadError::Network(format!("body download error: {}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

impl ConfigSource for HttpRemote {
    fn fetch(&self) -> BoxFuture<'_, Result<RemoteConfig, ConfigLoadError>> {
        Box::pin(self.fetch_config())
    }
}

impl BatchSink for HttpRemote {
    fn upload<'a>(&'a self, token: &'a str, batch: &'a PendingBatch) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(self.post_batch(token, batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GpsPoint, GridAggregator, Pulse, PulseKind};

    fn unreachable_remote() -> HttpRemote {
        // Port 9 (discard) on localhost: connection refused, fast
        let mut config = HttpRemoteConfig::new("http://127.0.0.1:9/");
        config.timeout = Duration::from_secs(2);
        HttpRemote::new(config).unwrap()
    }

    #[test]
    fn test_url_building() {
        let config = HttpRemoteConfig::new("https://example.org/");
        assert_eq!(config.url(&config.upload_path), "https://example.org/api/pulse/batch");
    }

    #[tokio::test]
    async fn test_config_fetch_failure_is_unreachable() {
        let err = unreachable_remote().fetch().await.unwrap_err();
        assert!(matches!(err, ConfigLoadError::Unreachable(_)), "{:?}", err);
    }

    /// Serve one canned response on a local port, after reading the full request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> HttpRemote {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        let mut config = HttpRemoteConfig::new(format!("http://{}", addr));
        config.timeout = Duration::from_secs(5);
        HttpRemote::new(config).unwrap()
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    fn one_cell_batch() -> PendingBatch {
        let mut grid = GridAggregator::new();
        grid.merge(&Pulse::new(GpsPoint::new(22.3, 114.17), PulseKind::Path, 0));
        PendingBatch::new(grid.drain(), 0)
    }

    #[tokio::test]
    async fn test_upload_rejected_status() {
        let remote = serve_once("HTTP/1.1 503 Service Unavailable", "").await;
        let err = remote.upload("tok", &one_cell_batch()).await.unwrap_err();
        assert_eq!(err, UploadError::Status(503));
    }

    #[tokio::test]
    async fn test_upload_accepted() {
        let remote = serve_once("HTTP/1.1 200 OK", "{}").await;
        remote.upload("tok", &one_cell_batch()).await.unwrap();
    }

    #[tokio::test]
    async fn test_config_fetch_parses_payload() {
        let remote = serve_once("HTTP/1.1 200 OK", r#"{"flushInterval": 30000}"#).await;
        let config = remote.fetch().await.unwrap();
        assert_eq!(config.flush_interval, Some(30_000.0));
    }

    #[tokio::test]
    async fn test_cell_query_bad_body_is_decode_error() {
        let remote = serve_once("HTTP/1.1 200 OK", "not json").await;
        let bounds = Bounds { min_lat: 22.0, max_lat: 23.0, min_lng: 114.0, max_lng: 115.0 };
        let err = remote.query_cells(&bounds, "tok").await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_upload_failure_is_network_error() {
        let err = unreachable_remote().upload("tok", &one_cell_batch()).await.unwrap_err();
        assert!(matches!(err, UploadError::Network(_)), "{:?}", err);
    }
}
