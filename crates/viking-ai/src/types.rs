//! Request/response schemas and capability traits for provider clients.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use viking_core::{VikingError, VikingResult};

/// Enumerates supported image payloads for multimodal summarisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Url { url: String },
    Base64 { mime_type: String, data: String },
}

/// Embedding modality requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedModality {
    Text,
    Multimodal,
}

impl EmbedModality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Multimodal => "multimodal",
        }
    }
}

/// One summarisation call: a prompt plus optional images.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SummariseRequest {
    pub prompt: String,
    pub images: Vec<ImageSource>,
}

impl SummariseRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            images: Vec::new(),
        }
    }
}

/// Token accounting reported by a provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of a summarisation call.
#[derive(Debug, Clone, PartialEq)]
pub struct SummariseOutcome {
    pub text: String,
    pub usage: TokenUsage,
}

/// Result of an embedding call.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedOutcome {
    pub vectors: Vec<Vec<f32>>,
    pub usage: TokenUsage,
}

/// Enumerates provider call failures.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unsupported modality: {0}")]
    UnsupportedModality(String),
    #[error("input too large after splitting: {0}")]
    OversizedInput(String),
}

impl AiError {
    /// Returns true when the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(error) => {
                error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
            }
            Self::HttpStatus { status, .. } => crate::retry::should_retry_status(*status),
            Self::MissingApiKey
            | Self::Serde(_)
            | Self::InvalidResponse(_)
            | Self::UnsupportedModality(_)
            | Self::OversizedInput(_) => false,
        }
    }
}

impl From<AiError> for VikingError {
    fn from(error: AiError) -> Self {
        match &error {
            AiError::UnsupportedModality(message) => VikingError::invalid_argument(message.clone()),
            AiError::OversizedInput(message) => VikingError::invalid_argument(message.clone()),
            AiError::Http(http) if http.is_timeout() => VikingError::timeout(error.to_string()),
            _ => VikingError::dependency(error.to_string()),
        }
    }
}

/// Capability contract for the summariser: `summarise(prompt, images?) → text`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarise(&self, request: SummariseRequest) -> Result<SummariseOutcome, AiError>;

    /// Cheap reachability probe used by readiness checks.
    async fn ping(&self) -> VikingResult<()> {
        Ok(())
    }
}

/// Capability contract for the embedder: `embed(texts, modality) → vectors`.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        texts: &[String],
        modality: EmbedModality,
    ) -> Result<EmbedOutcome, AiError>;

    /// Dimensionality of every vector this embedder produces.
    fn dimensions(&self) -> usize;

    /// Cheap reachability probe used by readiness checks.
    async fn ping(&self) -> VikingResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_follows_status() {
        let transient = AiError::HttpStatus {
            status: 429,
            body: "rate limited".to_string(),
        };
        assert!(transient.is_transient());
        let terminal = AiError::HttpStatus {
            status: 400,
            body: "bad request".to_string(),
        };
        assert!(!terminal.is_transient());
        assert!(!AiError::UnsupportedModality("audio".to_string()).is_transient());
    }

    #[test]
    fn viking_error_mapping_separates_caller_faults() {
        let error: VikingError = AiError::UnsupportedModality("audio".to_string()).into();
        assert_eq!(error.code, viking_core::ErrorCode::InvalidArgument);
        let error: VikingError = AiError::InvalidResponse("empty choices".to_string()).into();
        assert_eq!(error.code, viking_core::ErrorCode::DependencyError);
    }
}
