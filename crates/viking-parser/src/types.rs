//! Parser inputs, outputs, and the shared parse context.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use viking_agfs::{Agfs, WriteOptions};
use viking_core::{VikingError, VikingResult, VikingUri};

use crate::split::{DocNode, SplitLimits};
use crate::token::TokenCounter;

/// One parseable input: a local path or named raw bytes.
#[derive(Debug, Clone)]
pub enum ParseInput {
    Path(PathBuf),
    Bytes { name: String, bytes: Vec<u8> },
}

impl ParseInput {
    /// The file name the input is known by.
    pub fn file_name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("input")
                .to_string(),
            Self::Bytes { name, .. } => name.clone(),
        }
    }

    /// File stem used to name the document root.
    pub fn stem(&self) -> String {
        let name = self.file_name();
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name,
        }
    }

    /// Lower-cased extension, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        name.rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
    }

    /// Loads the raw content.
    pub fn load(&self) -> VikingResult<Vec<u8>> {
        match self {
            Self::Path(path) => std::fs::read(path).map_err(|error| {
                VikingError::from(error).in_op(&format!("read input {}", path.display()))
            }),
            Self::Bytes { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

/// Canonical output every parser returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub temp_dir_uri: VikingUri,
    pub source_format: String,
    pub parser_name: String,
    pub parse_duration_ms: u64,
    pub meta: Value,
}

/// Dependencies a parser needs to emit a scratch tree.
#[derive(Clone)]
pub struct ParseContext {
    pub agfs: Agfs,
    pub token_counter: Arc<dyn TokenCounter>,
    pub limits: SplitLimits,
}

impl ParseContext {
    pub fn new(agfs: Agfs, token_counter: Arc<dyn TokenCounter>, limits: SplitLimits) -> Self {
        Self {
            agfs,
            token_counter,
            limits,
        }
    }

    /// Writes a document tree under `parent`, creating directories on demand.
    pub async fn write_tree(&self, parent: &VikingUri, nodes: &[DocNode]) -> VikingResult<()> {
        for node in nodes {
            match node {
                DocNode::File { name, content } => {
                    self.agfs
                        .write(
                            &parent.join(name)?,
                            content.as_bytes(),
                            WriteOptions {
                                create_only: false,
                                create_parents: true,
                            },
                        )
                        .await?;
                }
                DocNode::Dir { name, children } => {
                    let dir = parent.join(name)?;
                    self.agfs.mkdirp(&dir).await?;
                    Box::pin(self.write_tree(&dir, children)).await?;
                }
            }
        }
        Ok(())
    }
}
