//! Shared vector store types and the `VectorStore` contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use viking_core::{VikingResult, VikingUri};

/// Enumerates the logical sources a vector can index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorSource {
    Abstract,
    Overview,
    Raw,
}

impl VectorSource {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abstract => "abstract",
            Self::Overview => "overview",
            Self::Raw => "raw",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "abstract" => Some(Self::Abstract),
            "overview" => Some(Self::Overview),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

/// Enumerates embedding modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Multimodal,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Multimodal => "multimodal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "multimodal" => Some(Self::Multimodal),
            _ => None,
        }
    }
}

/// One stored vector, keyed by `(uri, source)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub uri: VikingUri,
    pub source: VectorSource,
    pub modality: Modality,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub updated_at: u64,
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub uri: VikingUri,
    pub source: VectorSource,
    pub score: f32,
    pub payload: Value,
}

/// Options for `search`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub target_uri_prefix: Option<VikingUri>,
    pub limit: usize,
    pub score_threshold: Option<f32>,
}

/// Nearest-neighbour index contract keyed by URI and artefact source.
///
/// `upsert` is idempotent on `(uri, source)` and retried with the shared
/// backoff schedule on transient failures. `search` never retries; callers
/// tolerate empty results or surface the failure.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or atomically replaces the vector for `(uri, source)`.
    async fn upsert(&self, record: VectorRecord) -> VikingResult<()>;

    /// Returns hits sorted by descending score, ties broken by URI ascending,
    /// scores clamped into [0, 1].
    async fn search(&self, query: &[f32], options: &SearchOptions) -> VikingResult<Vec<SearchHit>>;

    /// Removes every vector whose URI equals or sits under `prefix`. Returns
    /// the number of removed records.
    async fn delete_prefix(&self, prefix: &VikingUri) -> VikingResult<u64>;

    /// Counts vectors whose URI equals or sits under `prefix`.
    async fn count_prefix(&self, prefix: &VikingUri) -> VikingResult<u64>;

    /// Cheap reachability probe used by readiness checks.
    async fn ping(&self) -> VikingResult<()>;
}

/// Cosine similarity over equal-length vectors; 0.0 on any mismatch.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut left_norm = 0.0f32;
    let mut right_norm = 0.0f32;
    for (a, b) in left.iter().zip(right.iter()) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

#[cfg(test)]
mod tests {
    use super::{cosine_similarity, Modality, VectorSource};

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        let same = cosine_similarity(&[0.6, 0.8], &[0.6, 0.8]);
        assert!((same - 1.0).abs() < 1e-6);
    }

    #[test]
    fn wire_labels_round_trip() {
        for source in [VectorSource::Abstract, VectorSource::Overview, VectorSource::Raw] {
            assert_eq!(VectorSource::parse(source.as_str()), Some(source));
        }
        for modality in [Modality::Text, Modality::Multimodal] {
            assert_eq!(Modality::parse(modality.as_str()), Some(modality));
        }
    }
}
