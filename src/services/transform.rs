use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Applies an AI style transform to image bytes.
///
/// `Ok(None)` means the backend answered without an image payload; the
/// pipeline then passes the original bytes through unchanged.
#[async_trait]
pub trait TransformBackend: Send + Sync {
    async fn transform(&self, image: &[u8], style: &str) -> Result<Option<Vec<u8>>, TransformError>;
}

/// Client for the Gemini image-generation API.
pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<RequestPart>,
}

// Externally tagged: serializes as {"text": ...} / {"inlineData": {...}}.
#[derive(Serialize)]
enum RequestPart {
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "inlineData")]
    InlineData(InlineData),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    inline_data: Option<InlineData>,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            model,
        }
    }

    fn build_prompt(style: &str) -> String {
        format!(
            "Transform this image into the \"{}\" style. \
             Preserve the subject and composition. Return only the transformed image.",
            style
        )
    }
}

#[async_trait]
impl TransformBackend for GeminiClient {
    async fn transform(&self, image: &[u8], style: &str) -> Result<Option<Vec<u8>>, TransformError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    RequestPart::Text(Self::build_prompt(style)),
                    RequestPart::InlineData(InlineData {
                        mime_type: "image/jpeg".to_string(),
                        data: base64::engine::general_purpose::STANDARD.encode(image),
                    }),
                ],
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["IMAGE".to_string(), "TEXT".to_string()],
            },
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(TransformError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransformError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let generated: GenerateResponse = response.json().await.map_err(TransformError::Request)?;

        // First inline image part wins; a text-only answer is a pass-through.
        let image_part = generated
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.inline_data);

        match image_part {
            Some(inline) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(inline.data.as_bytes())
                    .map_err(|e| TransformError::Decode(e.to_string()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("transform request failed: {0}")]
    Request(reqwest::Error),

    #[error("transform backend returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transform backend returned an undecodable image: {0}")]
    Decode(String),
}

impl TransformError {
    pub fn is_transient_network(&self) -> bool {
        matches!(self, TransformError::Request(e) if e.is_connect() || e.is_timeout())
    }

    /// Quota/throughput pushback per the backend contract: HTTP 429,
    /// `RESOURCE_EXHAUSTED`, `RATE_LIMIT_EXCEEDED`, or a "rate limit" message.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            TransformError::Api { status, message } => {
                *status == 429
                    || message.contains("RESOURCE_EXHAUSTED")
                    || message.contains("RATE_LIMIT_EXCEEDED")
                    || message.to_lowercase().contains("rate limit")
            }
            _ => false,
        }
    }

    /// Backend-side timeout markers; retryable but not a rate limit.
    pub fn is_backend_timeout(&self) -> bool {
        match self {
            TransformError::Api { status, message } => {
                *status == 504 || message.contains("GEMINI_TIMEOUT")
            }
            _ => false,
        }
    }
}
