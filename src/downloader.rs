//! The transport seam and the default HTTP downloader.
//!
//! The engine only ever talks to the transport through the [`Downloader`]
//! trait; construction of the underlying client (TLS, proxies, pooling) is
//! the collaborator's concern. [`HttpDownloader`] is the stock
//! implementation over a plain `reqwest` client, honoring the per-request
//! method, headers, body, and timeout overrides.

use crate::error::CrawlError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces a [`Response`] for a [`Request`], or an error. Errors of the
/// ignorable class are dropped silently by the dispatcher; all others reach
/// the request's errback.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, request: &Request) -> Result<Response, CrawlError>;
}

/// Default downloader over a shared `reqwest` client.
pub struct HttpDownloader {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CrawlError::Configuration(e.to_string()))?;
        Ok(HttpDownloader {
            client,
            default_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Wraps an externally configured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        HttpDownloader {
            client,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, request: &Request) -> Result<Response, CrawlError> {
        trace!(url = %request.url, method = %request.method, "downloading");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout.unwrap_or(self.default_timeout));
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        if let Some(referer) = &request.referer {
            builder = builder.header(reqwest::header::REFERER, referer);
        }

        let raw = builder
            .send()
            .await
            .map_err(|e| CrawlError::Download(e.to_string()))?;

        let status = raw.status();
        let headers = raw.headers().clone();
        let body = raw
            .bytes()
            .await
            .map_err(|e| CrawlError::Download(e.to_string()))?
            .to_vec();

        if !status.is_success() && !request.ok_http_codes.contains(&status.as_u16()) {
            debug!(url = %request.url, %status, "download returned unexpected status");
            return Err(CrawlError::Download(format!(
                "unexpected status {status} for {}",
                request.url
            )));
        }

        Ok(Response::new(status, headers, body, request.clone()))
    }
}
