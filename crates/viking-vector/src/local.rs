//! Local persistent vector store.
//!
//! Records live in memory for search and are persisted to JSONL (default) or
//! SQLite. Backend resolution honours path extension hints, then the
//! `VIKING_VECTOR_STORAGE` override, then the default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use viking_core::{
    current_unix_timestamp, write_text_atomic, VikingError, VikingResult, VikingUri,
};

use crate::types::{
    cosine_similarity, Modality, SearchHit, SearchOptions, VectorRecord, VectorSource, VectorStore,
};

pub const VECTOR_STORAGE_ENV: &str = "VIKING_VECTOR_STORAGE";

const VECTOR_JSONL_FILE_NAME: &str = "vectors.jsonl";
const VECTOR_SQLITE_FILE_NAME: &str = "vectors.sqlite";

const VECTOR_STORAGE_REASON_PATH_JSONL: &str = "vector_storage_backend_path_jsonl";
const VECTOR_STORAGE_REASON_PATH_SQLITE: &str = "vector_storage_backend_path_sqlite";
const VECTOR_STORAGE_REASON_ENV_JSONL: &str = "vector_storage_backend_env_jsonl";
const VECTOR_STORAGE_REASON_ENV_SQLITE: &str = "vector_storage_backend_env_sqlite";
const VECTOR_STORAGE_REASON_DEFAULT_JSONL: &str = "vector_storage_backend_default_jsonl";
const VECTOR_STORAGE_REASON_ENV_INVALID_FALLBACK: &str =
    "vector_storage_backend_env_invalid_fallback";

/// Enumerates supported local persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalVectorBackend {
    Jsonl,
    Sqlite,
}

impl LocalVectorBackend {
    pub fn label(self) -> &'static str {
        match self {
            Self::Jsonl => "jsonl",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedVectorBackend {
    backend: LocalVectorBackend,
    storage_path: PathBuf,
    reason_code: String,
}

/// Resolve the persistence backend from path hints, env override, and default.
fn resolve_vector_backend(root: &Path) -> ResolvedVectorBackend {
    let extension = root
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase());
    if matches!(extension.as_deref(), Some("jsonl")) {
        return ResolvedVectorBackend {
            backend: LocalVectorBackend::Jsonl,
            storage_path: root.to_path_buf(),
            reason_code: VECTOR_STORAGE_REASON_PATH_JSONL.to_string(),
        };
    }
    if matches!(extension.as_deref(), Some("sqlite" | "db")) {
        return ResolvedVectorBackend {
            backend: LocalVectorBackend::Sqlite,
            storage_path: root.to_path_buf(),
            reason_code: VECTOR_STORAGE_REASON_PATH_SQLITE.to_string(),
        };
    }

    let env_backend = std::env::var(VECTOR_STORAGE_ENV)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase());
    match env_backend.as_deref() {
        Some("jsonl") => ResolvedVectorBackend {
            backend: LocalVectorBackend::Jsonl,
            storage_path: root.join(VECTOR_JSONL_FILE_NAME),
            reason_code: VECTOR_STORAGE_REASON_ENV_JSONL.to_string(),
        },
        Some("sqlite") => ResolvedVectorBackend {
            backend: LocalVectorBackend::Sqlite,
            storage_path: root.join(VECTOR_SQLITE_FILE_NAME),
            reason_code: VECTOR_STORAGE_REASON_ENV_SQLITE.to_string(),
        },
        Some(other) if !other.is_empty() && other != "auto" => ResolvedVectorBackend {
            backend: LocalVectorBackend::Jsonl,
            storage_path: root.join(VECTOR_JSONL_FILE_NAME),
            reason_code: VECTOR_STORAGE_REASON_ENV_INVALID_FALLBACK.to_string(),
        },
        _ => ResolvedVectorBackend {
            backend: LocalVectorBackend::Jsonl,
            storage_path: root.join(VECTOR_JSONL_FILE_NAME),
            reason_code: VECTOR_STORAGE_REASON_DEFAULT_JSONL.to_string(),
        },
    }
}

type RecordKey = (String, VectorSource);

/// Vector store backed by local JSONL or SQLite persistence.
pub struct LocalVectorStore {
    backend: LocalVectorBackend,
    storage_path: PathBuf,
    records: Mutex<BTreeMap<RecordKey, VectorRecord>>,
}

impl LocalVectorStore {
    /// Opens (and loads) a store rooted at `root`.
    ///
    /// `root` may be a directory (the default file name is appended) or an
    /// explicit `.jsonl` / `.sqlite` file path.
    pub fn open(root: impl Into<PathBuf>) -> VikingResult<Self> {
        let root = root.into();
        let resolved = resolve_vector_backend(&root);
        tracing::debug!(
            backend = resolved.backend.label(),
            reason = resolved.reason_code.as_str(),
            path = %resolved.storage_path.display(),
            "resolved local vector storage backend"
        );

        let store = Self {
            backend: resolved.backend,
            storage_path: resolved.storage_path,
            records: Mutex::new(BTreeMap::new()),
        };
        store.load()?;
        Ok(store)
    }

    pub fn backend(&self) -> LocalVectorBackend {
        self.backend
    }

    fn load(&self) -> VikingResult<()> {
        let mut records = self.records.lock().expect("vector records lock");
        records.clear();
        match self.backend {
            LocalVectorBackend::Jsonl => {
                if !self.storage_path.exists() {
                    return Ok(());
                }
                let raw = std::fs::read_to_string(&self.storage_path)
                    .map_err(|error| VikingError::from(error).in_op("load vectors"))?;
                for line in raw.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    // Replay order makes the newest record for a key win.
                    let record: VectorRecord = serde_json::from_str(line)?;
                    records.insert((record.uri.as_str().to_string(), record.source), record);
                }
            }
            LocalVectorBackend::Sqlite => {
                if !self.storage_path.exists() {
                    return Ok(());
                }
                let conn = self.open_sqlite()?;
                let mut statement = conn
                    .prepare(
                        "SELECT uri, source, modality, vector, payload, updated_at FROM vectors",
                    )
                    .map_err(sqlite_error)?;
                let rows = statement
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    })
                    .map_err(sqlite_error)?;
                for row in rows {
                    let (uri, source, modality, vector, payload, updated_at) =
                        row.map_err(sqlite_error)?;
                    let record = VectorRecord {
                        uri: VikingUri::parse(&uri)?,
                        source: VectorSource::parse(&source).ok_or_else(|| {
                            VikingError::invariant_violation(format!(
                                "unknown vector source '{source}'"
                            ))
                        })?,
                        modality: Modality::parse(&modality).unwrap_or(Modality::Text),
                        vector: serde_json::from_str(&vector)?,
                        payload: serde_json::from_str(&payload)?,
                        updated_at: updated_at.max(0) as u64,
                    };
                    records.insert((record.uri.as_str().to_string(), record.source), record);
                }
            }
        }
        Ok(())
    }

    fn open_sqlite(&self) -> VikingResult<Connection> {
        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| VikingError::from(error).in_op("open vector store"))?;
        }
        let conn = Connection::open(&self.storage_path).map_err(sqlite_error)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vectors (
                uri TEXT NOT NULL,
                source TEXT NOT NULL,
                modality TEXT NOT NULL,
                vector TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (uri, source)
            )",
            [],
        )
        .map_err(sqlite_error)?;
        Ok(conn)
    }

    fn persist_upsert(&self, record: &VectorRecord) -> VikingResult<()> {
        match self.backend {
            LocalVectorBackend::Jsonl => {
                let line = serde_json::to_string(record)?;
                viking_core::append_jsonl_line(&self.storage_path, &line)
                    .map_err(|error| VikingError::from(error).in_op("persist vector"))
            }
            LocalVectorBackend::Sqlite => {
                let conn = self.open_sqlite()?;
                conn.execute(
                    "INSERT OR REPLACE INTO vectors
                     (uri, source, modality, vector, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.uri.as_str(),
                        record.source.as_str(),
                        record.modality.as_str(),
                        serde_json::to_string(&record.vector)?,
                        serde_json::to_string(&record.payload)?,
                        record.updated_at as i64,
                    ],
                )
                .map_err(sqlite_error)?;
                Ok(())
            }
        }
    }

    fn persist_full(&self, records: &BTreeMap<RecordKey, VectorRecord>) -> VikingResult<()> {
        match self.backend {
            LocalVectorBackend::Jsonl => {
                let mut lines = String::new();
                for record in records.values() {
                    lines.push_str(&serde_json::to_string(record)?);
                    lines.push('\n');
                }
                write_text_atomic(&self.storage_path, &lines)
                    .map_err(|error| VikingError::from(error).in_op("compact vectors"))
            }
            LocalVectorBackend::Sqlite => {
                let mut conn = self.open_sqlite()?;
                let tx = conn.transaction().map_err(sqlite_error)?;
                tx.execute("DELETE FROM vectors", []).map_err(sqlite_error)?;
                for record in records.values() {
                    tx.execute(
                        "INSERT INTO vectors
                         (uri, source, modality, vector, payload, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            record.uri.as_str(),
                            record.source.as_str(),
                            record.modality.as_str(),
                            serde_json::to_string(&record.vector)?,
                            serde_json::to_string(&record.payload)?,
                            record.updated_at as i64,
                        ],
                    )
                    .map_err(sqlite_error)?;
                }
                tx.commit().map_err(sqlite_error)
            }
        }
    }
}

fn sqlite_error(error: rusqlite::Error) -> VikingError {
    VikingError::dependency(format!("sqlite error: {error}"))
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn upsert(&self, mut record: VectorRecord) -> VikingResult<()> {
        if record.vector.is_empty() {
            return Err(VikingError::invalid_argument(format!(
                "refusing zero-length vector for '{}'",
                record.uri
            )));
        }
        if record.updated_at == 0 {
            record.updated_at = current_unix_timestamp();
        }
        self.persist_upsert(&record)?;
        let mut records = self.records.lock().expect("vector records lock");
        records.insert((record.uri.as_str().to_string(), record.source), record);
        Ok(())
    }

    async fn search(&self, query: &[f32], options: &SearchOptions) -> VikingResult<Vec<SearchHit>> {
        if options.limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.records.lock().expect("vector records lock");
        let mut hits = Vec::new();
        for record in records.values() {
            if let Some(prefix) = &options.target_uri_prefix {
                if !record.uri.starts_with(prefix) {
                    continue;
                }
            }
            let score = cosine_similarity(query, &record.vector).clamp(0.0, 1.0);
            if let Some(threshold) = options.score_threshold {
                if score < threshold {
                    continue;
                }
            }
            hits.push(SearchHit {
                uri: record.uri.clone(),
                source: record.source,
                score,
                payload: record.payload.clone(),
            });
        }
        drop(records);

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
        let mut records = self.records.lock().expect("vector records lock");
        let before = records.len();
        records.retain(|_, record| !record.uri.starts_with(prefix));
        let removed = (before - records.len()) as u64;
        if removed > 0 {
            self.persist_full(&records)?;
        }
        Ok(removed)
    }

    async fn count_prefix(&self, prefix: &VikingUri) -> VikingResult<u64> {
        let records = self.records.lock().expect("vector records lock");
        Ok(records
            .values()
            .filter(|record| record.uri.starts_with(prefix))
            .count() as u64)
    }

    async fn ping(&self) -> VikingResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use viking_core::ErrorCode;

    use super::*;

    fn record(uri: &str, source: VectorSource, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            uri: VikingUri::parse(uri).expect("uri"),
            source,
            modality: Modality::Text,
            vector,
            payload: json!({"abstract": uri}),
            updated_at: 0,
        }
    }

    fn search_options(prefix: Option<&str>, limit: usize) -> SearchOptions {
        SearchOptions {
            target_uri_prefix: prefix.map(|raw| VikingUri::parse(raw).expect("prefix")),
            limit,
            score_threshold: None,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_on_same_uri_and_source() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = LocalVectorStore::open(tempdir.path()).expect("open");
        store
            .upsert(record("viking://resources/doc", VectorSource::Abstract, vec![1.0, 0.0]))
            .await
            .expect("first");
        store
            .upsert(record("viking://resources/doc", VectorSource::Abstract, vec![0.0, 1.0]))
            .await
            .expect("second");

        assert_eq!(
            store
                .count_prefix(&VikingUri::parse("viking://resources").expect("uri"))
                .await
                .expect("count"),
            1
        );
        let hits = store
            .search(&[0.0, 1.0], &search_options(None, 10))
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn zero_length_vectors_are_rejected() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = LocalVectorStore::open(tempdir.path()).expect("open");
        let error = store
            .upsert(record("viking://resources/doc", VectorSource::Raw, Vec::new()))
            .await
            .expect_err("reject");
        assert_eq!(error.code, ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn search_orders_by_score_then_uri() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = LocalVectorStore::open(tempdir.path()).expect("open");
        store
            .upsert(record("viking://resources/b", VectorSource::Abstract, vec![1.0, 0.0]))
            .await
            .expect("upsert");
        store
            .upsert(record("viking://resources/a", VectorSource::Abstract, vec![1.0, 0.0]))
            .await
            .expect("upsert");
        store
            .upsert(record("viking://resources/c", VectorSource::Abstract, vec![0.5, 0.5]))
            .await
            .expect("upsert");

        let hits = store
            .search(&[1.0, 0.0], &search_options(None, 10))
            .await
            .expect("search");
        let uris: Vec<&str> = hits.iter().map(|hit| hit.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec!["viking://resources/a", "viking://resources/b", "viking://resources/c"]
        );
    }

    #[tokio::test]
    async fn prefix_filters_are_segment_aligned() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = LocalVectorStore::open(tempdir.path()).expect("open");
        store
            .upsert(record("viking://resources/doc/a", VectorSource::Abstract, vec![1.0]))
            .await
            .expect("upsert");
        store
            .upsert(record("viking://resources/doc2/b", VectorSource::Abstract, vec![1.0]))
            .await
            .expect("upsert");

        let hits = store
            .search(&[1.0], &search_options(Some("viking://resources/doc"), 10))
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri.as_str(), "viking://resources/doc/a");
    }

    #[tokio::test]
    async fn jsonl_store_reloads_after_reopen() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        {
            let store = LocalVectorStore::open(tempdir.path()).expect("open");
            assert_eq!(store.backend(), LocalVectorBackend::Jsonl);
            store
                .upsert(record("viking://resources/doc", VectorSource::Overview, vec![1.0, 2.0]))
                .await
                .expect("upsert");
        }
        let reopened = LocalVectorStore::open(tempdir.path()).expect("reopen");
        assert_eq!(
            reopened
                .count_prefix(&VikingUri::root())
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn sqlite_store_reloads_after_reopen() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("vectors.sqlite");
        {
            let store = LocalVectorStore::open(&path).expect("open");
            assert_eq!(store.backend(), LocalVectorBackend::Sqlite);
            store
                .upsert(record("viking://user/memories/m", VectorSource::Abstract, vec![0.1, 0.9]))
                .await
                .expect("upsert");
        }
        let reopened = LocalVectorStore::open(&path).expect("reopen");
        let hits = reopened
            .search(&[0.1, 0.9], &search_options(Some("viking://user/memories"), 5))
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_prefix_cascades_and_reports_count() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = LocalVectorStore::open(tempdir.path()).expect("open");
        for uri in [
            "viking://resources/doc",
            "viking://resources/doc/a",
            "viking://resources/other",
        ] {
            store
                .upsert(record(uri, VectorSource::Abstract, vec![1.0]))
                .await
                .expect("upsert");
        }
        let removed = store
            .delete_prefix(&VikingUri::parse("viking://resources/doc").expect("uri"))
            .await
            .expect("delete");
        assert_eq!(removed, 2);
        assert_eq!(
            store
                .count_prefix(&VikingUri::root())
                .await
                .expect("count"),
            1
        );
    }
}
