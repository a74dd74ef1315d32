//! Deterministic provider doubles used across crate and engine tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::{
    AiError, EmbedModality, EmbedOutcome, Embedder, SummariseOutcome, SummariseRequest, Summarizer,
    TokenUsage,
};

fn text_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|character: char| !character.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|token| !token.is_empty())
}

fn token_bucket(token: &str, dimensions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() % dimensions as u64) as usize
}

/// Deterministic bag-of-buckets embedding into a fixed dimensionality.
///
/// Tokens are hashed into buckets and counted; the counts are centred on
/// their mean so texts with no shared vocabulary sit near zero cosine, then
/// L2-normalised. Good enough to rank shared-vocabulary matches in tests.
pub fn embed_text_vector(text: &str, dimensions: usize) -> Vec<f32> {
    let dimensions = dimensions.max(1);
    let mut buckets = vec![0.0f32; dimensions];
    let mut total = 0.0f32;
    for token in text_tokens(text) {
        buckets[token_bucket(&token, dimensions)] += 1.0;
        total += 1.0;
    }
    if total == 0.0 {
        return buckets;
    }

    let mean = total / dimensions as f32;
    for bucket in &mut buckets {
        *bucket -= mean;
    }
    let magnitude = buckets
        .iter()
        .map(|component| component * component)
        .sum::<f32>()
        .sqrt();
    if magnitude > 0.0 {
        for component in &mut buckets {
            *component /= magnitude;
        }
    }
    buckets
}

/// Scripted summariser double: deterministic output, optional latency,
/// optional budget of leading transient failures, optional response script.
#[derive(Debug, Default)]
pub struct FakeSummarizer {
    delay_ms: u64,
    transient_failures: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    responses: Mutex<VecDeque<String>>,
}

impl FakeSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps this long before answering each call.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Fails the first `count` calls with a retryable status.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Queues scripted responses consumed in order before the synthetic
    /// default kicks back in.
    pub fn with_responses(self, responses: impl IntoIterator<Item = String>) -> Self {
        self.responses
            .lock()
            .expect("response script lock")
            .extend(responses);
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .expect("response script lock")
            .push_back(response.into());
    }

    /// Number of summarise calls observed so far.
    pub fn call_count(&self) -> usize {
        self.prompts.lock().expect("prompt log lock").len()
    }

    /// Snapshot of every prompt seen, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompt log lock").clone()
    }
}

fn leading_words(text: &str, count: usize) -> String {
    text.split_whitespace()
        .take(count)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Synthetic summary: a digest of the prompt plus, when the prompt carries a
/// bullet list of children, an inventory naming each of them. Mimics a real
/// summariser closely enough for routing tests.
fn synthesise_summary(prompt: &str) -> String {
    let digest = leading_words(prompt, 24);
    let bullets: Vec<&str> = prompt
        .lines()
        .filter(|line| line.trim_start().starts_with("- "))
        .collect();
    if bullets.is_empty() {
        return digest;
    }
    let names: Vec<&str> = bullets
        .iter()
        .filter_map(|line| {
            line.trim_start()
                .strip_prefix("- ")
                .map(|rest| rest.split([' ', ':', '(']).next().unwrap_or(rest))
        })
        .collect();
    format!("{digest} Covers {}.\n\n{}", names.join(", "), bullets.join("\n"))
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn summarise(&self, request: SummariseRequest) -> Result<SummariseOutcome, AiError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        {
            let mut prompts = self.prompts.lock().expect("prompt log lock");
            prompts.push(request.prompt.clone());
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AiError::HttpStatus {
                status: 503,
                body: "scripted transient failure".to_string(),
            });
        }

        let scripted = self
            .responses
            .lock()
            .expect("response script lock")
            .pop_front();
        let text = scripted.unwrap_or_else(|| synthesise_summary(&request.prompt));
        let input_tokens = (request.prompt.len() / 4) as u64;
        Ok(SummariseOutcome {
            text: text.clone(),
            usage: TokenUsage {
                input_tokens,
                output_tokens: text.split_whitespace().count() as u64,
            },
        })
    }
}

/// Embedder double producing deterministic signed-hash vectors.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        _modality: EmbedModality,
    ) -> Result<EmbedOutcome, AiError> {
        let vectors = texts
            .iter()
            .map(|text| embed_text_vector(text, self.dimensions))
            .collect::<Vec<_>>();
        let input_tokens = texts.iter().map(|text| (text.len() / 4) as u64).sum();
        Ok(EmbedOutcome {
            vectors,
            usage: TokenUsage {
                input_tokens,
                output_tokens: 0,
            },
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_is_deterministic_and_normalised() {
        let first = embed_text_vector("the user prefers vim", 64);
        let second = embed_text_vector("the user prefers vim", 64);
        assert_eq!(first, second);
        let magnitude: f32 = first.iter().map(|component| component * component).sum();
        assert!((magnitude - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated_ones() {
        let query = embed_text_vector("where does the user live", 128);
        let related = embed_text_vector("the user lives in Berlin", 128);
        let unrelated = embed_text_vector("quarterly revenue grew", 128);
        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }

    #[tokio::test]
    async fn synthetic_overviews_inventory_children() {
        let summariser = FakeSummarizer::new();
        let prompt = "Overview of 'doc'.\n\nChildren:\n- A.md (file): alpha\n- B.md (file): beta";
        let outcome = summariser
            .summarise(SummariseRequest::text(prompt))
            .await
            .expect("summarise");
        let first_paragraph = outcome.text.split("\n\n").next().expect("paragraph");
        assert!(first_paragraph.contains("Covers A.md, B.md."), "{first_paragraph}");
        assert!(outcome.text.contains("- B.md (file): beta"));
    }

    #[tokio::test]
    async fn scripted_responses_run_before_the_synthetic_default() {
        let summariser =
            FakeSummarizer::new().with_responses(["facts: User lives in Berlin.".to_string()]);
        let first = summariser
            .summarise(SummariseRequest::text("distil this"))
            .await
            .expect("scripted");
        assert_eq!(first.text, "facts: User lives in Berlin.");
        let second = summariser
            .summarise(SummariseRequest::text("plain prompt"))
            .await
            .expect("default");
        assert_eq!(second.text, "plain prompt");
    }

    #[tokio::test]
    async fn fake_summariser_scripts_failures_then_recovers() {
        let summariser = FakeSummarizer::new().with_transient_failures(1);
        let error = summariser
            .summarise(SummariseRequest::text("hello world"))
            .await
            .expect_err("scripted failure");
        assert!(error.is_transient());

        let outcome = summariser
            .summarise(SummariseRequest::text("hello world"))
            .await
            .expect("recovered");
        assert_eq!(outcome.text, "hello world");
        assert_eq!(summariser.call_count(), 2);
    }
}
