//! Memory distillation from committed sessions.
//!
//! The extractor asks the summariser to distil — not transcribe — memory
//! candidates from a conversation, then lays them out as a scratch tree of
//! categorised markdown pages ready for TreeBuilder promotion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use viking_agfs::{Agfs, WriteOptions};
use viking_ai::{SummariseRequest, Summarizer};
use viking_core::{rfc3339_now, VikingError, VikingResult, VikingUri};
use viking_parser::sanitize_name;

use crate::session::MessageRecord;

/// Enumerates memory categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Preferences,
    Facts,
    Events,
    Cases,
}

impl MemoryCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preferences => "preferences",
            Self::Facts => "facts",
            Self::Events => "events",
            Self::Cases => "cases",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().trim_matches(['[', ']']).to_ascii_lowercase().as_str() {
            "preference" | "preferences" => Some(Self::Preferences),
            "fact" | "facts" => Some(Self::Facts),
            "event" | "events" => Some(Self::Events),
            "case" | "cases" => Some(Self::Cases),
            _ => None,
        }
    }
}

/// One distilled memory candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCandidate {
    pub category: MemoryCategory,
    pub text: String,
}

/// Distils session transcripts into memory candidates.
pub struct MemoryExtractor {
    agfs: Agfs,
    summarizer: Arc<dyn Summarizer>,
}

impl MemoryExtractor {
    pub fn new(agfs: Agfs, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { agfs, summarizer }
    }

    /// Asks the summariser for memory candidates. An empty distillation is a
    /// valid outcome.
    pub async fn distil(&self, messages: &[MessageRecord]) -> VikingResult<Vec<MemoryCandidate>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let mut prompt = String::from(
            "Distil long-term memories from this conversation. Do not transcribe it. \
             Output one line per memory as 'category: fact', where category is one of \
             preferences, facts, events, cases. Output nothing when there is nothing \
             worth remembering.\n\nConversation:\n",
        );
        for message in messages {
            prompt.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
        }

        let outcome = self
            .summarizer
            .summarise(SummariseRequest::text(prompt))
            .await
            .map_err(VikingError::from)?;
        Ok(parse_candidates(&outcome.text))
    }

    /// Writes candidates as a scratch tree:
    /// `temp/<uuid>/session-<id>/<category>/<slug>.md`.
    pub async fn write_scratch(
        &self,
        session_id: &str,
        candidates: &[MemoryCandidate],
    ) -> VikingResult<VikingUri> {
        let temp_root = VikingUri::new_temp_root();
        let doc_root = temp_root.join(&format!("session-{session_id}"))?;
        self.agfs.mkdirp(&doc_root).await?;
        let extracted_at = rfc3339_now();

        for candidate in candidates {
            let category_dir = doc_root.join(candidate.category.as_str())?;
            let page = format!(
                "---\nsession_id: {session_id}\nextracted_at: {extracted_at}\ncategory: {}\n---\n\n{}\n",
                candidate.category.as_str(),
                candidate.text.trim(),
            );
            self.agfs
                .write(
                    &category_dir.join(&memory_slug(&candidate.text))?,
                    page.as_bytes(),
                    WriteOptions {
                        create_only: false,
                        create_parents: true,
                    },
                )
                .await?;
        }
        Ok(temp_root)
    }
}

/// Tolerant parser for 'category: fact' candidate lines.
pub fn parse_candidates(text: &str) -> Vec<MemoryCandidate> {
    let mut candidates = Vec::new();
    for line in text.lines() {
        let line = line
            .trim()
            .trim_start_matches(['-', '*'])
            .trim_start();
        if line.is_empty() {
            continue;
        }
        let Some((head, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(category) = MemoryCategory::parse(head) else {
            continue;
        };
        let fact = rest.trim();
        if fact.is_empty() {
            continue;
        }
        candidates.push(MemoryCandidate {
            category,
            text: fact.to_string(),
        });
    }
    candidates
}

/// Stable page name: leading words plus a short content hash.
fn memory_slug(text: &str) -> String {
    let stem: String = sanitize_name(
        &text
            .split_whitespace()
            .take(6)
            .collect::<Vec<_>>()
            .join(" "),
    );
    let digest = Sha256::digest(text.as_bytes());
    let tag = digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("{stem}-{tag}.md")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_parsing_accepts_common_shapes() {
        let text = "\
- preferences: User prefers vim.
facts: User lives in Berlin.
* [events] Met Alice on Monday.
noise without a category
unknown: skipped entirely
events: ";
        let candidates = parse_candidates(text);
        assert_eq!(
            candidates,
            vec![
                MemoryCandidate {
                    category: MemoryCategory::Preferences,
                    text: "User prefers vim.".to_string(),
                },
                MemoryCandidate {
                    category: MemoryCategory::Facts,
                    text: "User lives in Berlin.".to_string(),
                },
            ]
        );
    }

    #[test]
    fn bracketed_categories_need_their_own_separator() {
        // '[events] Met Alice' has no colon after the bracket; the tolerant
        // parser only accepts it when written '[events]: Met Alice'.
        let candidates = parse_candidates("[events]: Met Alice.");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].category, MemoryCategory::Events);
    }

    #[test]
    fn slugs_are_stable_and_distinct() {
        let first = memory_slug("User prefers vim.");
        let second = memory_slug("User prefers vim.");
        let other = memory_slug("User prefers emacs.");
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.ends_with(".md"));
        assert!(first.starts_with("User-prefers-vim"));
    }
}
