//! Outbound HTTP seam: the `Transport` trait, its reqwest implementation, and
//! the per-run `Session` that carries request statistics.
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::Http;
use crate::error::TransportError;

/// Expected body format of a page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFormat {
    Json,
    Html,
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Html(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &Url, format: PageFormat) -> Result<Payload, TransportError>;

    /// Stream the resource at `url` into `dest`; returns the byte count.
    async fn download(&self, url: &Url, dest: &mut File) -> Result<u64, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn from_config(cfg: &Http) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.timeout_seconds));
        if let Some(proxy) = cfg.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy).map_err(|err| map_reqwest(proxy, err))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|err| map_reqwest("client", err))?;
        Ok(Self { http })
    }

    async fn send(&self, url: &Url) -> Result<reqwest::Response, TransportError> {
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|err| map_reqwest(url.as_str(), err))?;
        let status = res.status();
        debug!(url = %url, %status, "GET");
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(url = %url, "rate limited by origin");
            }
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(res)
    }
}

fn map_reqwest(url: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
        }
    } else {
        TransportError::Request {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &Url, format: PageFormat) -> Result<Payload, TransportError> {
        let res = self.send(url).await?;
        let body = res
            .text()
            .await
            .map_err(|err| map_reqwest(url.as_str(), err))?;
        match format {
            PageFormat::Html => Ok(Payload::Html(body)),
            PageFormat::Json => serde_json::from_str(&body)
                .map(Payload::Json)
                .map_err(|err| TransportError::Decode {
                    url: url.to_string(),
                    message: err.to_string(),
                }),
        }
    }

    async fn download(&self, url: &Url, dest: &mut File) -> Result<u64, TransportError> {
        let mut res = self.send(url).await?;
        let mut written = 0u64;
        while let Some(chunk) = res
            .chunk()
            .await
            .map_err(|err| map_reqwest(url.as_str(), err))?
        {
            dest.write_all(&chunk)
                .await
                .map_err(|source| TransportError::Io {
                    url: url.to_string(),
                    source,
                })?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}

/// Request counters for one run.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub requests: AtomicU64,
    pub downloads: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

/// Explicit per-run context handed to fetchers and the media acquirer.
pub struct Session {
    transport: Box<dyn Transport>,
    stats: SessionStats,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            stats: SessionStats::default(),
        }
    }

    pub async fn fetch(&self, url: &Url, format: PageFormat) -> Result<Payload, TransportError> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.transport.fetch(url, format).await
    }

    pub async fn fetch_json(&self, url: &Url) -> Result<Value, TransportError> {
        match self.fetch(url, PageFormat::Json).await? {
            Payload::Json(value) => Ok(value),
            Payload::Html(_) => Err(TransportError::Decode {
                url: url.to_string(),
                message: "expected JSON, got HTML".into(),
            }),
        }
    }

    pub async fn fetch_html(&self, url: &Url) -> Result<String, TransportError> {
        match self.fetch(url, PageFormat::Html).await? {
            Payload::Html(body) => Ok(body),
            Payload::Json(value) => Ok(value.to_string()),
        }
    }

    pub async fn download(&self, url: &Url, dest: &mut File) -> Result<u64, TransportError> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let bytes = self.transport.download(url, dest).await?;
        self.stats.downloads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_downloaded
            .fetch_add(bytes, Ordering::Relaxed);
        Ok(bytes)
    }

    pub fn requests(&self) -> u64 {
        self.stats.requests.load(Ordering::Relaxed)
    }

    pub fn downloads(&self) -> u64 {
        self.stats.downloads.load(Ordering::Relaxed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.stats.bytes_downloaded.load(Ordering::Relaxed)
    }
}
