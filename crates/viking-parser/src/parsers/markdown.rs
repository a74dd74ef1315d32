//! Markdown parser: header splitting plus local asset extraction.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use viking_agfs::WriteOptions;
use viking_core::{VikingError, VikingResult, VikingUri};

use crate::registry::Parser;
use crate::split::{sanitize_name, split_document, DocNode};
use crate::types::{ParseContext, ParseInput, ParseResult};

const MARKDOWN_EXTENSIONS: [&str; 3] = ["md", "markdown", "mdown"];

/// Parser for markdown-like documents.
#[derive(Debug, Default)]
pub struct MarkdownParser;

fn image_ref_regex() -> &'static Regex {
    static IMAGE_REF: OnceLock<Regex> = OnceLock::new();
    IMAGE_REF.get_or_init(|| {
        Regex::new(r"!\[[^\]]*\]\(([^)\s]+)\)").expect("image ref regex")
    })
}

fn is_local_ref(target: &str) -> bool {
    !(target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("data:")
        || target.starts_with("viking://"))
}

/// An asset scheduled for copying next to the file that references it.
struct PlannedAsset {
    dir_segments: Vec<String>,
    name: String,
    bytes: Vec<u8>,
}

/// Rewrites local image references to sibling file names and plans the copies.
fn rewrite_assets(
    nodes: &mut [DocNode],
    source_dir: &Path,
    dir_segments: &[String],
    planned: &mut Vec<PlannedAsset>,
) {
    for node in nodes {
        match node {
            DocNode::File { content, .. } => {
                let mut rewritten = content.clone();
                for capture in image_ref_regex().captures_iter(content) {
                    let target = &capture[1];
                    if !is_local_ref(target) {
                        continue;
                    }
                    let asset_path = source_dir.join(target);
                    let Ok(bytes) = std::fs::read(&asset_path) else {
                        continue;
                    };
                    let asset_name = asset_path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .map(sanitize_name)
                        .unwrap_or_else(|| "asset".to_string());
                    rewritten = rewritten.replace(
                        &format!("({target})"),
                        &format!("({asset_name})"),
                    );
                    planned.push(PlannedAsset {
                        dir_segments: dir_segments.to_vec(),
                        name: asset_name,
                        bytes,
                    });
                }
                *content = rewritten;
            }
            DocNode::Dir { name, children } => {
                let mut nested = dir_segments.to_vec();
                nested.push(name.clone());
                rewrite_assets(children, source_dir, &nested, planned);
            }
        }
    }
}

#[async_trait]
impl Parser for MarkdownParser {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn can_handle(&self, input: &ParseInput, _bytes: &[u8]) -> bool {
        input
            .extension()
            .map(|extension| MARKDOWN_EXTENSIONS.contains(&extension.as_str()))
            .unwrap_or(false)
    }

    async fn parse(
        &self,
        input: &ParseInput,
        bytes: &[u8],
        ctx: &ParseContext,
    ) -> VikingResult<ParseResult> {
        let started = Instant::now();
        let text = std::str::from_utf8(bytes).map_err(|_| {
            VikingError::unsupported_format(format!(
                "'{}' is not valid UTF-8 markdown",
                input.file_name()
            ))
        })?;

        let stem = sanitize_name(&input.stem());
        let mut nodes = split_document(&stem, text, ctx.token_counter.as_ref(), &ctx.limits);

        let mut planned = Vec::new();
        if let ParseInput::Path(path) = input {
            if let Some(source_dir) = path.parent() {
                rewrite_assets(&mut nodes, source_dir, &[], &mut planned);
            }
        }

        let temp_root = VikingUri::new_temp_root();
        let doc_root = temp_root.join(&stem)?;
        ctx.agfs.mkdirp(&doc_root).await?;
        ctx.write_tree(&doc_root, &nodes).await?;

        let asset_count = planned.len();
        for asset in planned {
            let mut dir = doc_root.clone();
            for segment in &asset.dir_segments {
                dir = dir.join(segment)?;
            }
            ctx.agfs
                .write(
                    &dir.join(&asset.name)?,
                    &asset.bytes,
                    WriteOptions {
                        create_only: false,
                        create_parents: true,
                    },
                )
                .await?;
        }

        Ok(ParseResult {
            temp_dir_uri: temp_root,
            source_format: "markdown".to_string(),
            parser_name: self.name().to_string(),
            parse_duration_ms: started.elapsed().as_millis() as u64,
            meta: json!({
                "sections": nodes.len(),
                "assets": asset_count,
                "tokens": ctx.token_counter.count(text),
            }),
        })
    }
}
