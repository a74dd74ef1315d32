//! Append-only session logs with an idempotent commit state machine.
//!
//! Each session lives under `viking://.system/sessions/<id>/` as a JSONL
//! message log plus an atomically replaced `state.json`. Sessions move
//! `open → committing → committed`; committed sessions are immutable and
//! re-commits return the recorded result.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use viking_agfs::{Agfs, LsOptions, WriteOptions};
use viking_core::{
    current_unix_timestamp_ms, rfc3339_now, VikingError, VikingResult, VikingUri,
};

pub const SESSIONS_DIR: &str = "viking://.system/sessions";

const SESSION_SCHEMA_VERSION: u32 = 1;
const SESSION_LOG_NAME: &str = "log.jsonl";
const SESSION_STATE_NAME: &str = "state.json";

fn session_schema_version() -> u32 {
    SESSION_SCHEMA_VERSION
}

/// Enumerates message author roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One logged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: MessageRole,
    pub content: String,
    pub ts: u64,
}

/// Enumerates session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Committing,
    Committed,
}

/// Persisted session state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default = "session_schema_version")]
    pub schema_version: u32,
    pub session_id: String,
    pub created_at: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub target_uri: Option<VikingUri>,
    #[serde(default)]
    pub extracted: Option<u64>,
}

/// One row of a session listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub uri: VikingUri,
    pub is_dir: bool,
}

/// Result of a commit, cached for idempotent re-commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOutcome {
    pub session_id: String,
    pub target_uri: Option<VikingUri>,
    pub extracted: u64,
}

/// Append-only conversation log store.
pub struct SessionStore {
    agfs: Agfs,
    commit_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(agfs: Agfs) -> Self {
        Self {
            agfs,
            commit_locks: Mutex::new(HashMap::new()),
        }
    }

    fn sessions_root() -> VikingResult<VikingUri> {
        VikingUri::parse(SESSIONS_DIR)
    }

    fn session_dir(id: &str) -> VikingResult<VikingUri> {
        Self::sessions_root()?.join(id)
    }

    /// Creates a session and returns its id.
    pub async fn create(&self) -> VikingResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let state = SessionState {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: id.clone(),
            created_at: rfc3339_now(),
            status: SessionStatus::Open,
            target_uri: None,
            extracted: None,
        };
        let dir = Self::session_dir(&id)?;
        self.agfs.mkdirp(&dir).await?;
        self.write_state(&state).await?;
        tracing::debug!(session_id = id.as_str(), "created session");
        Ok(id)
    }

    /// Appends one message to an open session.
    pub async fn append(&self, id: &str, role: MessageRole, content: &str) -> VikingResult<()> {
        let state = self.state(id).await?;
        match state.status {
            SessionStatus::Open => {}
            SessionStatus::Committing => {
                return Err(VikingError::invalid_argument(format!(
                    "session '{id}' is committing and no longer accepts messages"
                )));
            }
            SessionStatus::Committed => {
                return Err(VikingError::invalid_argument(format!(
                    "session '{id}' is committed and immutable"
                )));
            }
        }
        let record = MessageRecord {
            role,
            content: content.to_string(),
            ts: current_unix_timestamp_ms(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let log_uri = Self::session_dir(id)?.join(SESSION_LOG_NAME)?;
        self.agfs.append(&log_uri, line.as_bytes()).await
    }

    /// Returns every message in append order.
    pub async fn messages(&self, id: &str) -> VikingResult<Vec<MessageRecord>> {
        self.state(id).await?;
        let log_uri = Self::session_dir(id)?.join(SESSION_LOG_NAME)?;
        let bytes = match self.agfs.read(&log_uri).await {
            Ok(bytes) => bytes,
            Err(error) if error.code == viking_core::ErrorCode::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut messages = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<MessageRecord>(line) {
                Ok(record) => messages.push(record),
                Err(error) => {
                    tracing::warn!(session_id = id, %error, "skipping unreadable log line");
                }
            }
        }
        Ok(messages)
    }

    /// Deletes a session and its log.
    pub async fn delete(&self, id: &str) -> VikingResult<()> {
        let dir = Self::session_dir(id)?;
        if !self.agfs.exists(&dir).await? {
            return Err(VikingError::not_found(format!("session '{id}'")));
        }
        self.agfs.delete(&dir, true).await?;
        self.commit_locks.lock().await.remove(id);
        Ok(())
    }

    /// Lists every stored session, tolerating an empty store.
    pub async fn list_all(&self) -> VikingResult<Vec<SessionSummary>> {
        let root = Self::sessions_root()?;
        let entries = match self.agfs.ls(&root, LsOptions::default()).await {
            Ok(entries) => entries,
            Err(error) if error.code == viking_core::ErrorCode::NotFound => Vec::new(),
            Err(error) => return Err(error),
        };
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let session_id = entry.uri.name()?.to_string();
                Some(SessionSummary {
                    session_id,
                    uri: entry.uri,
                    is_dir: entry.is_dir,
                })
            })
            .collect())
    }

    /// Loads the persisted state of a session.
    pub async fn state(&self, id: &str) -> VikingResult<SessionState> {
        let state_uri = Self::session_dir(id)?.join(SESSION_STATE_NAME)?;
        let bytes = self.agfs.read(&state_uri).await.map_err(|error| {
            if error.code == viking_core::ErrorCode::NotFound {
                VikingError::not_found(format!("session '{id}'"))
            } else {
                error
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_state(&self, state: &SessionState) -> VikingResult<()> {
        let state_uri = Self::session_dir(&state.session_id)?.join(SESSION_STATE_NAME)?;
        self.agfs
            .write(
                &state_uri,
                &serde_json::to_vec_pretty(state)?,
                WriteOptions {
                    create_only: false,
                    create_parents: true,
                },
            )
            .await
    }

    /// Transitions `open → committing` (or re-enters `committing` during
    /// crash recovery). Returns the cached outcome when already committed.
    pub async fn begin_commit(&self, id: &str) -> VikingResult<Option<CommitOutcome>> {
        let mut state = self.state(id).await?;
        match state.status {
            SessionStatus::Committed => Ok(Some(CommitOutcome {
                session_id: id.to_string(),
                target_uri: state.target_uri.clone(),
                extracted: state.extracted.unwrap_or(0),
            })),
            SessionStatus::Open | SessionStatus::Committing => {
                state.status = SessionStatus::Committing;
                self.write_state(&state).await?;
                Ok(None)
            }
        }
    }

    /// Records the commit result and seals the session.
    pub async fn finish_commit(
        &self,
        id: &str,
        target_uri: Option<VikingUri>,
        extracted: u64,
    ) -> VikingResult<CommitOutcome> {
        let mut state = self.state(id).await?;
        state.status = SessionStatus::Committed;
        state.target_uri = target_uri.clone();
        state.extracted = Some(extracted);
        self.write_state(&state).await?;
        Ok(CommitOutcome {
            session_id: id.to_string(),
            target_uri,
            extracted,
        })
    }

    /// Per-session lock serialising concurrent commits.
    pub async fn commit_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.commit_locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use viking_agfs::MemoryBackend;
    use viking_core::ErrorCode;

    use super::*;

    async fn store() -> SessionStore {
        let agfs = Agfs::new(Arc::new(MemoryBackend::new()));
        agfs.init_scope_roots().await.expect("init");
        SessionStore::new(agfs)
    }

    #[tokio::test]
    async fn append_and_list_round_trip_in_order() {
        let store = store().await;
        let id = store.create().await.expect("create");
        store
            .append(&id, MessageRole::User, "I live in Berlin.")
            .await
            .expect("append");
        store
            .append(&id, MessageRole::Assistant, "Noted.")
            .await
            .expect("append");

        let messages = store.messages(&id).await.expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "I live in Berlin.");
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn missing_sessions_report_not_found() {
        let store = store().await;
        let error = store.messages("nope").await.expect_err("missing");
        assert_eq!(error.code, ErrorCode::NotFound);
        let error = store.delete("nope").await.expect_err("missing");
        assert_eq!(error.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn committed_sessions_are_immutable() {
        let store = store().await;
        let id = store.create().await.expect("create");
        store
            .append(&id, MessageRole::User, "hello")
            .await
            .expect("append");
        assert!(store.begin_commit(&id).await.expect("begin").is_none());
        let outcome = store
            .finish_commit(&id, None, 0)
            .await
            .expect("finish");
        assert_eq!(outcome.extracted, 0);

        let error = store
            .append(&id, MessageRole::User, "too late")
            .await
            .expect_err("sealed");
        assert_eq!(error.code, ErrorCode::InvalidArgument);

        // Re-commit returns the recorded result.
        let cached = store
            .begin_commit(&id)
            .await
            .expect("begin again")
            .expect("cached outcome");
        assert_eq!(cached.extracted, 0);
    }

    #[tokio::test]
    async fn list_all_tolerates_empty_store_and_reports_sessions() {
        let store = store().await;
        assert!(store.list_all().await.expect("empty").is_empty());
        let id = store.create().await.expect("create");
        let sessions = store.list_all().await.expect("list");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, id);
        assert!(sessions[0].is_dir);
    }
}
