use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Where and how a processed image is uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub public_id: String,
    pub folder: String,
    pub format: String,
}

/// Handle to a stored image.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub public_id: String,
    pub secure_url: String,
}

/// Persists processed image bytes and returns a public handle.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn store(&self, image: &[u8], request: &UploadRequest) -> Result<StoredImage, StorageError>;
}

/// Client for the Cloudinary upload API (signed uploads).
pub struct CloudinaryClient {
    http: Client,
    cloud_name: String,
    api_key: String,
    api_secret: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    public_id: String,
    secure_url: String,
}

impl CloudinaryClient {
    pub fn new(cloud_name: String, api_key: String, api_secret: String) -> Self {
        Self {
            http: Client::new(),
            cloud_name,
            api_key,
            api_secret,
        }
    }

    /// SHA-256 signature over the alphabetically-ordered upload params,
    /// with the API secret appended.
    fn sign(&self, params: &[(&str, &str)]) -> String {
        let mut sorted: Vec<_> = params.to_vec();
        sorted.sort_by_key(|(name, _)| *name);

        let to_sign = sorted
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("&");

        let mut hasher = Sha256::new();
        hasher.update(to_sign.as_bytes());
        hasher.update(self.api_secret.as_bytes());
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl StorageBackend for CloudinaryClient {
    async fn store(&self, image: &[u8], request: &UploadRequest) -> Result<StoredImage, StorageError> {
        let url = format!(
            "https://api.cloudinary.com/v1_1/{}/image/upload",
            self.cloud_name
        );

        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.sign(&[
            ("folder", &request.folder),
            ("format", &request.format),
            ("public_id", &request.public_id),
            ("signature_algorithm", "sha256"),
            ("timestamp", &timestamp),
        ]);

        let file = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(image)
        );

        let form = [
            ("file", file.as_str()),
            ("api_key", &self.api_key),
            ("folder", &request.folder),
            ("format", &request.format),
            ("public_id", &request.public_id),
            ("signature_algorithm", "sha256"),
            ("timestamp", &timestamp),
            ("signature", &signature),
        ];

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(StorageError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let uploaded: UploadResponse = response.json().await.map_err(StorageError::Request)?;

        Ok(StoredImage {
            public_id: uploaded.public_id,
            secure_url: uploaded.secure_url,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("upload request failed: {0}")]
    Request(reqwest::Error),

    #[error("storage backend returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
}

impl StorageError {
    pub fn is_transient_network(&self) -> bool {
        matches!(self, StorageError::Request(e) if e.is_connect() || e.is_timeout())
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            StorageError::Api { status, message } => {
                *status == 429 || message.to_lowercase().contains("rate limit")
            }
            _ => false,
        }
    }

    pub fn is_backend_timeout(&self) -> bool {
        match self {
            StorageError::Api { status, message } => {
                *status == 504 || message.contains("CLOUDINARY_TIMEOUT")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_over_param_order() {
        let client = CloudinaryClient::new(
            "demo".to_string(),
            "key".to_string(),
            "secret".to_string(),
        );

        let forward = client.sign(&[("folder", "f"), ("public_id", "p"), ("timestamp", "1")]);
        let shuffled = client.sign(&[("timestamp", "1"), ("folder", "f"), ("public_id", "p")]);

        assert_eq!(forward, shuffled);
        assert_eq!(forward.len(), 64);
        assert!(forward.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_depends_on_secret() {
        let a = CloudinaryClient::new("demo".into(), "key".into(), "secret-a".into());
        let b = CloudinaryClient::new("demo".into(), "key".into(), "secret-b".into());

        let params = [("public_id", "p"), ("timestamp", "1")];
        assert_ne!(a.sign(&params), b.sign(&params));
    }
}
