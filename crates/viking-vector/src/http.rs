//! Remote vector store driver speaking a small JSON protocol.
//!
//! Upserts retry with the shared backoff schedule on transient statuses;
//! searches never retry — callers tolerate empty results or surface the
//! failure.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use viking_core::backoff::{next_backoff_ms_with_jitter, MAX_ATTEMPTS};
use viking_core::{VikingError, VikingResult, VikingUri};

use crate::types::{SearchHit, SearchOptions, VectorRecord, VectorSource, VectorStore};

/// Connection settings for the remote vector store.
#[derive(Debug, Clone)]
pub struct HttpVectorConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
    /// Attempt budget for idempotent calls, clamped to the shared maximum.
    pub max_retries: usize,
}

/// Vector store client for a remote HTTP backend.
#[derive(Debug, Clone)]
pub struct HttpVectorStore {
    client: reqwest::Client,
    config: HttpVectorConfig,
}

#[derive(Debug, Deserialize)]
struct WireHit {
    uri: String,
    source: String,
    score: f32,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<WireHit>,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    removed: u64,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    #[serde(default)]
    count: u64,
}

fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

impl HttpVectorStore {
    pub fn new(config: HttpVectorConfig) -> VikingResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !config.api_key.trim().is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", config.api_key.trim()))
                .map_err(|error| {
                    VikingError::invalid_argument(format!("invalid API key header: {error}"))
                })?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .map_err(|error| VikingError::dependency(error.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/{op}", self.config.api_base.trim_end_matches('/'))
    }

    async fn post_once(&self, op: &str, body: &Value) -> VikingResult<Value> {
        let response = self
            .client
            .post(self.endpoint(op))
            .json(body)
            .send()
            .await
            .map_err(|error| VikingError::dependency(format!("vector {op}: {error}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| VikingError::dependency(format!("vector {op}: {error}")))?;
        if !status.is_success() {
            return Err(VikingError::dependency(format!(
                "vector {op} returned status {status}: {text}"
            )));
        }
        serde_json::from_str(&text).map_err(|error| {
            VikingError::dependency(format!("vector {op}: invalid response: {error}"))
        })
    }

    async fn post_with_retry(&self, op: &str, body: &Value) -> VikingResult<Value> {
        let attempts = self.config.max_retries.clamp(1, MAX_ATTEMPTS);
        let mut last_error = VikingError::dependency(format!("vector {op}: no attempt made"));
        for attempt in 0..attempts {
            match self.post_once(op, body).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retryable = error
                        .message
                        .rsplit("status ")
                        .next()
                        .and_then(|rest| rest.split(&[' ', ':'][..]).next())
                        .and_then(|raw| raw.parse::<u16>().ok())
                        .map(should_retry_status)
                        // Connect/timeout failures have no status and are retryable.
                        .unwrap_or(true);
                    if !retryable || attempt + 1 == attempts {
                        return Err(error);
                    }
                    let delay_ms = next_backoff_ms_with_jitter(attempt);
                    tracing::debug!(op, attempt, delay_ms, "retrying vector store call");
                    last_error = error;
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(&self, record: VectorRecord) -> VikingResult<()> {
        if record.vector.is_empty() {
            return Err(VikingError::invalid_argument(format!(
                "refusing zero-length vector for '{}'",
                record.uri
            )));
        }
        let body = serde_json::to_value(&record)?;
        self.post_with_retry("upsert", &body).await?;
        Ok(())
    }

    async fn search(&self, query: &[f32], options: &SearchOptions) -> VikingResult<Vec<SearchHit>> {
        if options.limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "query_vector": query,
            "target_uri_prefix": options
                .target_uri_prefix
                .as_ref()
                .map(|prefix| prefix.as_str()),
            "limit": options.limit,
            "score_threshold": options.score_threshold,
        });
        let value = self.post_once("search", &body).await?;
        let response: SearchResponse = serde_json::from_value(value)
            .map_err(|error| VikingError::dependency(format!("vector search: {error}")))?;

        let mut hits = Vec::with_capacity(response.hits.len());
        for hit in response.hits {
            let Some(source) = VectorSource::parse(&hit.source) else {
                continue;
            };
            hits.push(SearchHit {
                uri: VikingUri::parse(&hit.uri)?,
                source,
                score: hit.score.clamp(0.0, 1.0),
                payload: hit.payload,
            });
        }
        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.uri.cmp(&right.uri))
        });
        hits.truncate(options.limit);
        Ok(hits)
    }

    async fn delete_prefix(&self, prefix: &VikingUri) -> VikingResult<u64> {
        let body = json!({ "prefix": prefix.as_str() });
        let value = self.post_with_retry("delete", &body).await?;
        let response: DeleteResponse = serde_json::from_value(value)
            .map_err(|error| VikingError::dependency(format!("vector delete: {error}")))?;
        Ok(response.removed)
    }

    async fn count_prefix(&self, prefix: &VikingUri) -> VikingResult<u64> {
        let body = json!({ "prefix": prefix.as_str() });
        let value = self.post_once("count", &body).await?;
        let response: CountResponse = serde_json::from_value(value)
            .map_err(|error| VikingError::dependency(format!("vector count: {error}")))?;
        Ok(response.count)
    }

    async fn ping(&self) -> VikingResult<()> {
        let response = self
            .client
            .get(self.endpoint("health"))
            .send()
            .await
            .map_err(|error| VikingError::dependency(format!("vector health: {error}")))?;
        if !response.status().is_success() {
            return Err(VikingError::dependency(format!(
                "vector health returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;
    use viking_core::{ErrorCode, VikingUri};

    use super::*;
    use crate::types::{Modality, VectorRecord, VectorSource, VectorStore};

    fn store(base: String) -> HttpVectorStore {
        HttpVectorStore::new(HttpVectorConfig {
            api_base: base,
            api_key: "test-key".to_string(),
            request_timeout_ms: 2_000,
            max_retries: 2,
        })
        .expect("store")
    }

    #[tokio::test]
    async fn search_parses_and_orders_hits() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/search")
                    .header("authorization", "Bearer test-key");
                then.status(200).json_body(json!({
                    "hits": [
                        {"uri": "viking://resources/b", "source": "abstract", "score": 0.9},
                        {"uri": "viking://resources/a", "source": "abstract", "score": 1.4},
                    ]
                }));
            })
            .await;

        let hits = store(server.base_url())
            .search(
                &[1.0, 0.0],
                &SearchOptions {
                    target_uri_prefix: None,
                    limit: 10,
                    score_threshold: None,
                },
            )
            .await
            .expect("search");
        mock.assert_async().await;
        assert_eq!(hits.len(), 2);
        // Scores above 1.0 are clamped; clamped leader still sorts first.
        assert_eq!(hits[0].uri.as_str(), "viking://resources/a");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_retries_transient_statuses() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(POST).path("/upsert");
                then.status(503).body("overloaded");
            })
            .await;

        let record = VectorRecord {
            uri: VikingUri::parse("viking://resources/doc").expect("uri"),
            source: VectorSource::Abstract,
            modality: Modality::Text,
            vector: vec![1.0],
            payload: json!({}),
            updated_at: 1,
        };
        let error = store(server.base_url())
            .upsert(record)
            .await
            .expect_err("exhausted");
        assert_eq!(error.code, ErrorCode::DependencyError);
        assert!(failing.hits_async().await >= 2, "should have retried");
    }

    #[tokio::test]
    async fn search_does_not_retry() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(POST).path("/search");
                then.status(503).body("overloaded");
            })
            .await;

        let error = store(server.base_url())
            .search(
                &[1.0],
                &SearchOptions {
                    target_uri_prefix: None,
                    limit: 5,
                    score_threshold: None,
                },
            )
            .await
            .expect_err("fail fast");
        assert_eq!(error.code, ErrorCode::DependencyError);
        assert_eq!(failing.hits_async().await, 1);
    }
}
