//! Provider clients and shared AI transport types for Viking.
//!
//! Defines the summariser and embedder capability traits, retry behaviour,
//! OpenAI-compatible HTTP clients, and deterministic test doubles.

pub mod openai;
pub mod retry;
pub mod testing;
mod types;

pub use openai::{OpenAiEmbedderClient, OpenAiSummariserClient};
pub use testing::{embed_text_vector, FakeSummarizer, HashEmbedder};
pub use types::{
    AiError, EmbedModality, EmbedOutcome, Embedder, ImageSource, SummariseOutcome,
    SummariseRequest, Summarizer, TokenUsage,
};
