//! Gemini `generateContent` client.
//!
//! Provides a `GenerativeModel` trait so the requestors can be driven by the
//! real Gemini API or by a scripted model in tests.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ModelConfig;

const API_KEY_HEADER: &str = "x-goog-api-key";

// ============================================================================
// GenerativeModel trait
// ============================================================================

/// One piece of a multimodal prompt.
#[derive(Debug, Clone)]
pub enum PromptPart {
    Text(String),
    Image { mime_type: String, data: Bytes },
}

#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub parts: Vec<PromptPart>,
    /// Ask the API for `application/json` output.
    pub json_output: bool,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![PromptPart::Text(text.into())],
            json_output: false,
        }
    }

    pub fn with_image(mut self, mime_type: impl Into<String>, data: Bytes) -> Self {
        self.parts.push(PromptPart::Image {
            mime_type: mime_type.into(),
            data,
        });
        self
    }

    pub fn expect_json(mut self) -> Self {
        self.json_output = true;
        self
    }

    /// Concatenated text parts; handy for assertions and logging.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                PromptPart::Text(t) => Some(t.as_str()),
                PromptPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Abstraction over text/vision generation providers.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(&self, prompt: Prompt) -> Result<String, ModelError>;

    /// Model name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Model call timed out after {}ms", .limit.as_millis())]
    Timeout { limit: Duration },

    #[error("Response body could not be decoded: {0}")]
    Decode(String),

    #[error("Model returned no text (finish reason: {finish_reason})")]
    EmptyResponse { finish_reason: String },

    #[error("Missing API key")]
    MissingApiKey,
}

// The request URL never reaches error text or client responses.
impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        ModelError::Http(e.without_url())
    }
}

impl ModelError {
    /// Whether the upstream answered with something other than a usable body.
    pub fn is_malformed(&self) -> bool {
        matches!(self, ModelError::Decode(_) | ModelError::EmptyResponse { .. })
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ModelError::Timeout { .. } => true,
            ModelError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

// ============================================================================
// Gemini API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum GeminiPart {
    Text(String),
    InlineData(InlineData),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: Option<GeminiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    code: u16,
    message: String,
}

// ============================================================================
// GeminiClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    config: ModelConfig,
}

impl GeminiClient {
    /// Build a client; `api_key` falls back to `GOOGLE_API_KEY`.
    pub fn new(api_key: Option<String>, config: ModelConfig) -> Result<Self, ModelError> {
        let api_key = api_key
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .unwrap_or_default();

        if api_key.is_empty() {
            return Err(ModelError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate_once(&self, prompt: Prompt) -> Result<String, ModelError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
        );

        let parts = prompt
            .parts
            .into_iter()
            .map(|part| match part {
                PromptPart::Text(text) => GeminiPart::Text(text),
                PromptPart::Image { mime_type, data } => GeminiPart::InlineData(InlineData {
                    mime_type,
                    data: STANDARD.encode(&data),
                }),
            })
            .collect();

        let request = GenerateRequest {
            contents: vec![GeminiContent { role: "user", parts }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                top_k: self.config.top_k,
                max_output_tokens: self.config.max_output_tokens,
                response_mime_type: prompt.json_output.then_some("application/json"),
            },
        };

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let error_detail = serde_json::from_str::<GeminiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error);

            let (code, message) = error_detail
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::error!(code = code, message = %message, "Gemini API error");

            return Err(ModelError::Api { code, message });
        }

        let body = response.bytes().await?;
        let parsed: GenerateResponse =
            serde_json::from_slice(&body).map_err(|e| ModelError::Decode(e.to_string()))?;

        let candidate = parsed.candidates.into_iter().next();
        let finish_reason = candidate
            .as_ref()
            .and_then(|c| c.finish_reason.clone())
            .unwrap_or_else(|| "NO_CANDIDATES".to_string());

        let text: String = candidate
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ModelError::EmptyResponse { finish_reason });
        }

        Ok(text)
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    async fn generate(&self, prompt: Prompt) -> Result<String, ModelError> {
        let limit = Duration::from_secs(self.config.timeout_seconds);
        match tokio::time::timeout(limit, self.generate_once(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout { limit }),
        }
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// TESTS
// ============================================================================
