use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

/// Fetches source image bytes for the pipeline's first stage.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// HTTPS image downloader backed by a shared reqwest client.
pub struct HttpImageFetcher {
    http: Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { http }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(FetchError::EmptyBody);
        }

        Ok(body.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("image request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("image request returned HTTP {0}")]
    Status(StatusCode),

    #[error("image request returned an empty body")]
    EmptyBody,
}

impl FetchError {
    /// Connection-level faults (refused, DNS, socket timeout) that a later
    /// delivery attempt may not hit again.
    pub fn is_transient_network(&self) -> bool {
        match self {
            FetchError::Request(e) => e.is_connect() || e.is_timeout(),
            FetchError::Status(status) => *status == StatusCode::REQUEST_TIMEOUT,
            FetchError::EmptyBody => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::Status(status) if *status == StatusCode::TOO_MANY_REQUESTS)
    }
}
