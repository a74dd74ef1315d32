//! OpenAI-compatible provider clients.
//!
//! `OpenAiSummariserClient` drives `/chat/completions`; `OpenAiEmbedderClient`
//! drives `/embeddings`. Both retry transient failures with the shared
//! backoff schedule and honour server `retry-after` floors.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use viking_core::backoff::MAX_ATTEMPTS;
use viking_core::{EmbedderConfig, SummariserConfig, VikingError, VikingResult};

use crate::retry::{
    is_retryable_http_error, new_request_id, parse_retry_after_ms, provider_retry_delay_ms,
    should_retry_status,
};
use crate::types::{
    AiError, EmbedModality, EmbedOutcome, Embedder, ImageSource, SummariseOutcome,
    SummariseRequest, Summarizer, TokenUsage,
};

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl WireUsage {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingDatum>,
    usage: Option<WireUsage>,
}

fn build_http_client(api_key: &str, timeout_ms: u64) -> Result<reqwest::Client, AiError> {
    if api_key.trim().is_empty() {
        return Err(AiError::MissingApiKey);
    }
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
        .map_err(|error| AiError::InvalidResponse(format!("invalid API key header: {error}")))?;
    headers.insert(AUTHORIZATION, auth);
    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(std::time::Duration::from_millis(timeout_ms.max(1)))
        .build()?)
}

async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
    max_retries: usize,
) -> Result<String, AiError> {
    let attempts = max_retries.clamp(1, MAX_ATTEMPTS);
    let mut attempt = 0usize;
    loop {
        let request_id = new_request_id();
        let response = client
            .post(url)
            .header("x-viking-request-id", request_id)
            .header("x-viking-retry-attempt", attempt.to_string())
            .json(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.text().await?);
                }
                let retry_after_ms = parse_retry_after_ms(response.headers());
                let body_text = response.text().await.unwrap_or_default();
                if !should_retry_status(status.as_u16()) || attempt + 1 >= attempts {
                    return Err(AiError::HttpStatus {
                        status: status.as_u16(),
                        body: body_text,
                    });
                }
                let delay_ms = provider_retry_delay_ms(attempt, retry_after_ms);
                tracing::debug!(status = status.as_u16(), attempt, delay_ms, "retrying provider call");
                sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            Err(error) => {
                if !is_retryable_http_error(&error) || attempt + 1 >= attempts {
                    return Err(AiError::Http(error));
                }
                let delay_ms = provider_retry_delay_ms(attempt, None);
                sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        }
        attempt += 1;
    }
}

/// Summariser client for OpenAI-compatible chat endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiSummariserClient {
    client: reqwest::Client,
    config: SummariserConfig,
}

impl OpenAiSummariserClient {
    pub fn new(config: SummariserConfig) -> Result<Self, AiError> {
        let client = build_http_client(&config.api_key, config.request_timeout_ms)?;
        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }
        format!("{base}/chat/completions")
    }

    fn content_blocks(request: &SummariseRequest) -> Vec<Value> {
        let mut blocks = vec![json!({ "type": "text", "text": request.prompt })];
        for image in &request.images {
            let url = match image {
                ImageSource::Url { url } => url.clone(),
                ImageSource::Base64 { mime_type, data } => {
                    format!("data:{mime_type};base64,{data}")
                }
            };
            blocks.push(json!({ "type": "image_url", "image_url": { "url": url } }));
        }
        blocks
    }
}

#[async_trait]
impl Summarizer for OpenAiSummariserClient {
    async fn summarise(&self, request: SummariseRequest) -> Result<SummariseOutcome, AiError> {
        let body = json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": Self::content_blocks(&request),
            }],
        });
        let raw = post_with_retry(
            &self.client,
            &self.completions_url(),
            &body,
            self.config.max_retries,
        )
        .await?;
        let parsed: ChatResponse = serde_json::from_str(&raw)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AiError::InvalidResponse("response carried no choices".to_string()))?;
        Ok(SummariseOutcome {
            text: choice.message.content,
            usage: parsed.usage.map(WireUsage::into_usage).unwrap_or_default(),
        })
    }

    async fn ping(&self) -> VikingResult<()> {
        if self.config.api_base.trim().is_empty() {
            return Err(VikingError::dependency("summariser api_base is empty"));
        }
        Ok(())
    }
}

/// Embedder client for OpenAI-compatible embedding endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedderClient {
    client: reqwest::Client,
    config: EmbedderConfig,
}

impl OpenAiEmbedderClient {
    pub fn new(config: EmbedderConfig) -> Result<Self, AiError> {
        let client = build_http_client(&config.api_key, config.request_timeout_ms)?;
        Ok(Self { client, config })
    }

    fn embeddings_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/embeddings") {
            return base.to_string();
        }
        format!("{base}/embeddings")
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedderClient {
    async fn embed(
        &self,
        texts: &[String],
        modality: EmbedModality,
    ) -> Result<EmbedOutcome, AiError> {
        if modality == EmbedModality::Multimodal {
            return Err(AiError::UnsupportedModality(
                "this embedding endpoint accepts text only".to_string(),
            ));
        }
        if texts.is_empty() {
            return Ok(EmbedOutcome {
                vectors: Vec::new(),
                usage: TokenUsage::default(),
            });
        }

        let body = json!({
            "model": self.config.model,
            "input": texts,
        });
        let raw = post_with_retry(
            &self.client,
            &self.embeddings_url(),
            &body,
            self.config.max_retries,
        )
        .await?;
        let parsed: EmbeddingResponse = serde_json::from_str(&raw)?;
        if parsed.data.len() != texts.len() {
            return Err(AiError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        let mut vectors = Vec::with_capacity(parsed.data.len());
        for datum in parsed.data {
            if datum.embedding.is_empty() {
                return Err(AiError::InvalidResponse(
                    "provider returned a zero-length embedding".to_string(),
                ));
            }
            vectors.push(datum.embedding);
        }
        Ok(EmbedOutcome {
            vectors,
            usage: parsed.usage.map(WireUsage::into_usage).unwrap_or_default(),
        })
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn ping(&self) -> VikingResult<()> {
        if self.config.api_base.trim().is_empty() {
            return Err(VikingError::dependency("embedder api_base is empty"));
        }
        Ok(())
    }
}
