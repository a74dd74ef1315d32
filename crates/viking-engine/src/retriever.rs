//! Hierarchical retrieval.
//!
//! Abstracts index directories, so one vector search can route a query
//! without opening every leaf: shortlist globally, recurse into busy roots
//! whose own abstract surfaced, then filter, rank, dedupe, and truncate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use unicode_normalization::UnicodeNormalization;
use viking_agfs::{Agfs, LsOptions};
use viking_ai::{EmbedModality, Embedder};
use viking_core::{
    current_unix_timestamp, RequestTrace, Scope, VikingError, VikingResult, VikingUri,
};
use viking_vector::{SearchHit, SearchOptions, VectorSource, VectorStore};

use crate::embedding::memory_category;

/// Default relevance floor for `find`.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.3;

const SHORTLIST_FLOOR: usize = 40;
const ROUTE_FANOUT_MIN: usize = 8;

/// Memory categories deduped by URI only.
const EVENT_LIKE_CATEGORIES: [&str; 2] = ["events", "cases"];

/// Options for `find`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub target_uri: Option<VikingUri>,
    pub limit: usize,
    pub score_threshold: Option<f32>,
    /// Recent conversation context appended to the query before embedding.
    pub context: Option<String>,
}

/// One ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FindResult {
    pub uri: VikingUri,
    pub score: f32,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub category: Option<String>,
    pub hotness: Option<f32>,
}

/// Routes queries from the namespace root toward leaves.
pub struct HierarchicalRetriever {
    agfs: Agfs,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    default_score_threshold: f32,
    memory_half_life_days: f64,
}

impl HierarchicalRetriever {
    pub fn new(
        agfs: Agfs,
        vector: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        default_score_threshold: f32,
        memory_half_life_days: f64,
    ) -> Self {
        Self {
            agfs,
            vector,
            embedder,
            default_score_threshold,
            memory_half_life_days,
        }
    }

    pub async fn find(
        &self,
        query: &str,
        options: &FindOptions,
        trace: &RequestTrace,
    ) -> VikingResult<Vec<FindResult>> {
        let limit = if options.limit == 0 { 10 } else { options.limit };
        let query_text = match &options.context {
            Some(context) if !context.trim().is_empty() => format!("{query}\n\n{context}"),
            _ => query.to_string(),
        };

        trace.event("search", "embed_query", "ok", json!({}));
        let embed_outcome = self
            .embedder
            .embed(&[query_text], EmbedModality::Text)
            .await
            .map_err(VikingError::from)?;
        trace.add_token_usage(embed_outcome.usage.input_tokens, embed_outcome.usage.output_tokens);
        let query_vector = embed_outcome
            .vectors
            .into_iter()
            .next()
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| VikingError::dependency("embedder returned no query vector"))?;

        let scope_prefix = options
            .target_uri
            .clone()
            .unwrap_or_else(VikingUri::root);
        let shortlist_limit = (limit * 4).max(SHORTLIST_FLOOR);

        let mut merged: HashMap<(VikingUri, VectorSource), SearchHit> = HashMap::new();
        let shortlist = self
            .search_once(&query_vector, &scope_prefix, shortlist_limit, trace)
            .await?;
        let roots = self.routing_roots(&shortlist, &scope_prefix);
        merge_hits(&mut merged, shortlist);

        for root in roots {
            if !self.should_route_into(&root).await {
                continue;
            }
            trace.event("search", "route", "ok", json!({ "root": root.as_str() }));
            let nested = self
                .search_once(&query_vector, &root, shortlist_limit, trace)
                .await?;
            merge_hits(&mut merged, nested);
        }

        // Best hit per URI, regardless of which artefact matched.
        let mut best: BTreeMap<VikingUri, SearchHit> = BTreeMap::new();
        for hit in merged.into_values() {
            match best.get(&hit.uri) {
                Some(existing) if existing.score >= hit.score => {}
                _ => {
                    best.insert(hit.uri.clone(), hit);
                }
            }
        }

        let threshold = options
            .score_threshold
            .unwrap_or(self.default_score_threshold);
        let mut results: Vec<FindResult> = Vec::new();
        for (uri, hit) in best {
            if hit.score < threshold {
                continue;
            }
            let category = hit
                .payload
                .get("category")
                .and_then(|value| value.as_str())
                .map(str::to_string)
                .or_else(|| memory_category(&uri));
            let hotness = if uri.scope() == Some(Scope::User) {
                Some(payload_hotness(
                    &hit.payload,
                    current_unix_timestamp(),
                    self.memory_half_life_days,
                ))
            } else {
                None
            };
            let abstract_text = hit
                .payload
                .get("text")
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string();
            results.push(FindResult {
                uri,
                score: hit.score,
                abstract_text,
                category,
                hotness,
            });
        }
        trace.count("vector.candidates_after_threshold", results.len() as f64);

        results.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.uri.cmp(&right.uri))
        });
        let mut results = dedupe_memory_results(results);
        results.truncate(limit);

        trace.gauge("vector.returned", json!(results.len()));
        if let Ok(scanned) = self.vector.count_prefix(&scope_prefix).await {
            trace.gauge("vector.vectors_scanned", json!(scanned));
        }
        Ok(results)
    }

    async fn search_once(
        &self,
        query_vector: &[f32],
        prefix: &VikingUri,
        limit: usize,
        trace: &RequestTrace,
    ) -> VikingResult<Vec<SearchHit>> {
        let hits = self
            .vector
            .search(
                query_vector,
                &SearchOptions {
                    target_uri_prefix: Some(prefix.clone()).filter(|prefix| !prefix.is_root()),
                    limit,
                    score_threshold: Some(0.0),
                },
            )
            .await?;
        trace.count("vector.search_calls", 1.0);
        trace.count("vector.candidates_scored", hits.len() as f64);
        Ok(hits)
    }

    /// Content roots (e.g. `viking://resources/foo`) whose own abstract made
    /// the shortlist.
    fn routing_roots(&self, shortlist: &[SearchHit], scope_prefix: &VikingUri) -> Vec<VikingUri> {
        let mut roots = Vec::new();
        for hit in shortlist {
            if hit.source != VectorSource::Abstract {
                continue;
            }
            let Some(root) = content_root(&hit.uri) else {
                continue;
            };
            if hit.uri != root {
                continue;
            }
            if !root.starts_with(scope_prefix) || root == *scope_prefix {
                continue;
            }
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots
    }

    /// Routing is only worth a second search when the root fans out widely.
    async fn should_route_into(&self, root: &VikingUri) -> bool {
        match self
            .agfs
            .ls(
                root,
                LsOptions {
                    recursive: false,
                    include_hidden: false,
                    node_limit: Some(ROUTE_FANOUT_MIN),
                },
            )
            .await
        {
            Ok(children) => children.len() >= ROUTE_FANOUT_MIN,
            Err(_) => false,
        }
    }
}

fn merge_hits(
    merged: &mut HashMap<(VikingUri, VectorSource), SearchHit>,
    hits: Vec<SearchHit>,
) {
    for hit in hits {
        let key = (hit.uri.clone(), hit.source);
        match merged.get(&key) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                merged.insert(key, hit);
            }
        }
    }
}

/// First stable content directory under a scope root.
fn content_root(uri: &VikingUri) -> Option<VikingUri> {
    let segments: Vec<&str> = uri.segments().collect();
    let root_segments: &[&str] = match uri.scope()? {
        Scope::Resources => {
            if segments.len() < 2 {
                return None;
            }
            &segments[..2]
        }
        Scope::User | Scope::Agent => {
            if segments.len() < 3 {
                return None;
            }
            &segments[..3]
        }
        Scope::Temp | Scope::System => return None,
    };
    let mut root = VikingUri::root();
    for segment in root_segments {
        root = root.join(segment).ok()?;
    }
    Some(root)
}

/// Collapses duplicate memory facts: same category plus same normalised
/// abstract keeps only the highest scorer. Event-like categories dedupe by
/// URI alone.
fn dedupe_memory_results(results: Vec<FindResult>) -> Vec<FindResult> {
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(results.len());
    for result in results {
        let is_memory = result.uri.scope() == Some(Scope::User);
        let category = result.category.clone().unwrap_or_default();
        if !is_memory || EVENT_LIKE_CATEGORIES.contains(&category.as_str()) {
            out.push(result);
            continue;
        }
        let key = (category, normalise_for_dedup(&result.abstract_text));
        // Results arrive rank-ordered, so the first holder of a key is the
        // highest scorer.
        if seen.insert(key) {
            out.push(result);
        }
    }
    out
}

/// NFKC, lower-case, whitespace runs collapsed, ends trimmed.
pub fn normalise_for_dedup(text: &str) -> String {
    let normalised: String = text.nfkc().collect();
    normalised
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hotness in [0, 1]: access frequency damped by recency decay.
pub fn hotness_score(
    active_count: u64,
    updated_at: Option<u64>,
    now: u64,
    half_life_days: f64,
) -> f32 {
    let Some(updated_at) = updated_at else {
        return 0.0;
    };
    let frequency = 1.0 / (1.0 + (-((active_count as f64).ln_1p())).exp());
    let age_days = (now.saturating_sub(updated_at) as f64) / 86_400.0;
    let decay_rate = std::f64::consts::LN_2 / half_life_days.max(f64::EPSILON);
    let recency = (-decay_rate * age_days).exp();
    (frequency * recency) as f32
}

fn payload_hotness(payload: &serde_json::Value, now: u64, half_life_days: f64) -> f32 {
    let active_count = payload
        .get("active_count")
        .and_then(|value| value.as_u64())
        .unwrap_or(0);
    let updated_at = payload.get("updated_at").and_then(|value| value.as_u64());
    hotness_score(active_count, updated_at, now, half_life_days)
}
