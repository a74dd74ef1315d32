//! Foundational low-level utilities shared across Viking crates.
//!
//! Provides the `viking://` URI model, the public error taxonomy, engine
//! configuration, atomic file-write helpers, cooperative cancellation, and
//! the request trace collector used by retrieval and ingest workflows.

pub mod atomic_io;
pub mod backoff;
pub mod cancel;
pub mod config;
pub mod error;
pub mod time_utils;
pub mod trace;
pub mod uri;

pub use atomic_io::{append_jsonl_line, write_bytes_atomic, write_text_atomic};
pub use cancel::CancelToken;
pub use config::{
    AgfsBackendKind, CodeSummaryMode, EmbedderConfig, EngineConfig, SummariserConfig,
    VectorBackendKind,
};
pub use error::{ErrorCode, VikingError, VikingResult};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, rfc3339_now};
pub use trace::{RequestTrace, TraceEvent, TraceResult};
pub use uri::{is_hidden_name, Scope, ScopeKind, VikingUri};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn time_utils_round_trip_bounds() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn write_text_atomic_writes_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("sample.txt");
        write_text_atomic(&path, "hello world").expect("write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "hello world");
    }
}
