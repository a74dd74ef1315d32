//! Central engine configuration.
//!
//! One serde-deserializable record per concern; absent fields fall back to
//! the documented defaults. Backend selections honour `VIKING_*` environment
//! overrides, with the chosen backend and the reason recorded for logs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{VikingError, VikingResult};

pub const AGFS_BACKEND_ENV: &str = "VIKING_AGFS_BACKEND";
pub const VECTOR_BACKEND_ENV: &str = "VIKING_VECTOR_BACKEND";

const CONFIG_REASON_ENV_OVERRIDE: &str = "backend_env_override";
const CONFIG_REASON_CONFIG_VALUE: &str = "backend_config_value";
const CONFIG_REASON_ENV_INVALID_FALLBACK: &str = "backend_env_invalid_fallback";

/// Enumerates supported AGFS backend selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgfsBackendKind {
    Local,
    Memory,
}

impl AgfsBackendKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Memory => "memory",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Enumerates supported vector store backend selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackendKind {
    Local,
    Http,
}

impl VectorBackendKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Http => "http",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

/// Enumerates code summarisation modes for the parser pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSummaryMode {
    Ast,
    Llm,
    AstLlm,
}

impl CodeSummaryMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ast => "ast",
            Self::Llm => "llm",
            Self::AstLlm => "ast_llm",
        }
    }
}

/// Connection settings for the summariser provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummariserConfig {
    #[serde(default)]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_summariser_model")]
    pub model: String,
    #[serde(default = "default_summariser_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for SummariserConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            model: default_summariser_model(),
            request_timeout_ms: default_summariser_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Connection settings for the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedderConfig {
    #[serde(default)]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_embedder_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_embedder_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            model: default_embedder_model(),
            dimensions: default_embedding_dimensions(),
            request_timeout_ms: default_embedder_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Central configuration record for the context engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_agfs_backend")]
    pub agfs_backend: AgfsBackendKind,
    #[serde(default = "default_vector_backend")]
    pub vector_backend: VectorBackendKind,
    #[serde(default)]
    pub vector_http_base: String,
    #[serde(default)]
    pub vector_http_key: String,
    #[serde(default)]
    pub summariser: SummariserConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,

    #[serde(default = "default_max_concurrent_semantic_jobs")]
    pub max_concurrent_semantic_jobs: usize,
    #[serde(default = "default_max_concurrent_llm")]
    pub max_concurrent_llm: usize,
    #[serde(default = "default_max_concurrent_embedding_jobs")]
    pub max_concurrent_embedding_jobs: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,

    #[serde(default = "default_code_summary_mode")]
    pub code_summary_mode: CodeSummaryMode,
    #[serde(default = "default_split_token_limit")]
    pub split_token_limit: usize,
    #[serde(default = "default_merge_token_floor")]
    pub merge_token_floor: usize,
    #[serde(default = "default_max_images_per_call")]
    pub max_images_per_call: usize,
    #[serde(default = "default_max_sections_per_call")]
    pub max_sections_per_call: usize,

    #[serde(default = "default_score_threshold")]
    pub default_score_threshold: f32,
    #[serde(default = "default_memory_half_life_days")]
    pub memory_half_life_days: f64,

    #[serde(default = "default_job_lease_timeout_ms")]
    pub job_lease_timeout_ms: u64,
    #[serde(default = "default_temp_grace_period_ms")]
    pub temp_grace_period_ms: u64,
    #[serde(default = "default_agfs_op_timeout_ms")]
    pub agfs_op_timeout_ms: u64,
    #[serde(default = "default_vector_search_timeout_ms")]
    pub vector_search_timeout_ms: u64,

    #[serde(default = "default_trace_max_events")]
    pub trace_max_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes via defaults")
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".viking")
}

fn default_agfs_backend() -> AgfsBackendKind {
    AgfsBackendKind::Local
}

fn default_vector_backend() -> VectorBackendKind {
    VectorBackendKind::Local
}

fn default_summariser_model() -> String {
    "viking-summariser".to_string()
}

fn default_embedder_model() -> String {
    "viking-embedder".to_string()
}

fn default_embedding_dimensions() -> usize {
    256
}

fn default_summariser_timeout_ms() -> u64 {
    180_000
}

fn default_embedder_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> usize {
    5
}

fn default_max_concurrent_semantic_jobs() -> usize {
    10
}

fn default_max_concurrent_llm() -> usize {
    10
}

fn default_max_concurrent_embedding_jobs() -> usize {
    4
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_code_summary_mode() -> CodeSummaryMode {
    CodeSummaryMode::Ast
}

fn default_split_token_limit() -> usize {
    1024
}

fn default_merge_token_floor() -> usize {
    512
}

fn default_max_images_per_call() -> usize {
    10
}

fn default_max_sections_per_call() -> usize {
    20
}

fn default_score_threshold() -> f32 {
    0.3
}

fn default_memory_half_life_days() -> f64 {
    7.0
}

fn default_job_lease_timeout_ms() -> u64 {
    600_000
}

fn default_temp_grace_period_ms() -> u64 {
    3_600_000
}

fn default_agfs_op_timeout_ms() -> u64 {
    30_000
}

fn default_vector_search_timeout_ms() -> u64 {
    10_000
}

fn default_trace_max_events() -> usize {
    500
}

/// A backend selection plus the reason it was chosen, for startup logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBackend<T> {
    pub backend: T,
    pub reason_code: String,
}

impl EngineConfig {
    /// Loads configuration from a JSON file; absent fields use defaults.
    pub fn load(path: &Path) -> VikingResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            VikingError::from(error).in_op(&format!("load config {}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|error| VikingError::invalid_argument(format!("malformed config: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations no component could run with.
    pub fn validate(&self) -> VikingResult<()> {
        if self.max_concurrent_semantic_jobs == 0 || self.max_concurrent_llm == 0 {
            return Err(VikingError::invalid_argument(
                "queue concurrency caps must be positive",
            ));
        }
        if self.embedding_batch_size == 0 {
            return Err(VikingError::invalid_argument(
                "embedding_batch_size must be positive",
            ));
        }
        if self.max_images_per_call == 0 || self.max_sections_per_call == 0 {
            return Err(VikingError::invalid_argument(
                "per-call batching limits must be positive",
            ));
        }
        if self.split_token_limit == 0 || self.merge_token_floor > self.split_token_limit {
            return Err(VikingError::invalid_argument(
                "split_token_limit must be positive and >= merge_token_floor",
            ));
        }
        if self.embedder.dimensions == 0 {
            return Err(VikingError::invalid_argument(
                "embedder.dimensions must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.default_score_threshold) {
            return Err(VikingError::invalid_argument(
                "default_score_threshold must be within [0, 1]",
            ));
        }
        Ok(())
    }

    /// Resolves the AGFS backend, honouring the env override.
    pub fn resolve_agfs_backend(&self) -> ResolvedBackend<AgfsBackendKind> {
        resolve_backend(AGFS_BACKEND_ENV, self.agfs_backend, AgfsBackendKind::parse)
    }

    /// Resolves the vector backend, honouring the env override.
    pub fn resolve_vector_backend(&self) -> ResolvedBackend<VectorBackendKind> {
        resolve_backend(
            VECTOR_BACKEND_ENV,
            self.vector_backend,
            VectorBackendKind::parse,
        )
    }

    /// Directory holding the AGFS local backend tree.
    pub fn agfs_root(&self) -> PathBuf {
        self.workspace_root.join("agfs")
    }

    /// Directory holding vector store persistence.
    pub fn vectors_root(&self) -> PathBuf {
        self.workspace_root.join("vectors")
    }
}

fn resolve_backend<T: Copy>(
    env_name: &str,
    configured: T,
    parse: fn(&str) -> Option<T>,
) -> ResolvedBackend<T> {
    match std::env::var(env_name) {
        Ok(raw) if !raw.trim().is_empty() => match parse(&raw) {
            Some(backend) => ResolvedBackend {
                backend,
                reason_code: CONFIG_REASON_ENV_OVERRIDE.to_string(),
            },
            None => ResolvedBackend {
                backend: configured,
                reason_code: CONFIG_REASON_ENV_INVALID_FALLBACK.to_string(),
            },
        },
        _ => ResolvedBackend {
            backend: configured,
            reason_code: CONFIG_REASON_CONFIG_VALUE.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_semantic_jobs, 10);
        assert_eq!(config.max_concurrent_llm, 10);
        assert_eq!(config.embedding_batch_size, 32);
        assert_eq!(config.split_token_limit, 1024);
        assert_eq!(config.merge_token_floor, 512);
        assert_eq!(config.code_summary_mode, CodeSummaryMode::Ast);
        assert_eq!(config.default_score_threshold, 0.3);
        assert_eq!(config.job_lease_timeout_ms, 600_000);
        assert_eq!(config.summariser.request_timeout_ms, 180_000);
        assert_eq!(config.embedder.request_timeout_ms, 60_000);
        assert_eq!(config.embedder.dimensions, 256);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn partial_config_file_falls_back_to_defaults() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("viking.json");
        std::fs::write(
            &path,
            r#"{"max_concurrent_llm": 3, "summariser": {"api_base": "http://localhost:9"}}"#,
        )
        .expect("write");
        let config = EngineConfig::load(&path).expect("load");
        assert_eq!(config.max_concurrent_llm, 3);
        assert_eq!(config.summariser.api_base, "http://localhost:9");
        assert_eq!(config.max_concurrent_semantic_jobs, 10);
    }

    #[test]
    fn invalid_caps_are_rejected() {
        let mut config = EngineConfig::default();
        config.max_concurrent_llm = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.merge_token_floor = 2_048;
        assert!(config.validate().is_err());
    }

    #[test]
    fn workspace_subdirectories_hang_off_root() {
        let mut config = EngineConfig::default();
        config.workspace_root = PathBuf::from("/tmp/viking-ws");
        assert_eq!(config.agfs_root(), PathBuf::from("/tmp/viking-ws/agfs"));
        assert_eq!(config.vectors_root(), PathBuf::from("/tmp/viking-ws/vectors"));
    }
}
