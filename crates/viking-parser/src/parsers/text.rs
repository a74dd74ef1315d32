//! Plain-text fallback parser.
//!
//! Claims explicit text extensions plus any input whose leading bytes sniff
//! as NUL-free UTF-8; headerless content falls through to paragraph
//! chunking inside the splitter.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use viking_core::{VikingError, VikingResult, VikingUri};

use crate::registry::Parser;
use crate::split::{sanitize_name, split_document};
use crate::types::{ParseContext, ParseInput, ParseResult};

const TEXT_EXTENSIONS: [&str; 4] = ["txt", "text", "log", "rst"];
const SNIFF_BYTES: usize = 8 * 1024;

/// Parser of last resort for plain text.
#[derive(Debug, Default)]
pub struct TextParser;

fn sniffs_as_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    let window = &bytes[..bytes.len().min(SNIFF_BYTES)];
    if window.contains(&0) {
        return false;
    }
    // Tolerate a multi-byte sequence cut at the window edge.
    match std::str::from_utf8(window) {
        Ok(_) => true,
        Err(error) => error.valid_up_to() + 4 >= window.len(),
    }
}

#[async_trait]
impl Parser for TextParser {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_handle(&self, input: &ParseInput, bytes: &[u8]) -> bool {
        if let Some(extension) = input.extension() {
            if TEXT_EXTENSIONS.contains(&extension.as_str()) {
                return true;
            }
        }
        sniffs_as_text(bytes)
    }

    async fn parse(
        &self,
        input: &ParseInput,
        bytes: &[u8],
        ctx: &ParseContext,
    ) -> VikingResult<ParseResult> {
        let started = Instant::now();
        let text = String::from_utf8_lossy(bytes);
        if text.trim().is_empty() && !bytes.is_empty() {
            return Err(VikingError::unsupported_format(format!(
                "'{}' carries no text content",
                input.file_name()
            )));
        }

        let stem = sanitize_name(&input.stem());
        let nodes = split_document(&stem, &text, ctx.token_counter.as_ref(), &ctx.limits);

        let temp_root = VikingUri::new_temp_root();
        let doc_root = temp_root.join(&stem)?;
        ctx.agfs.mkdirp(&doc_root).await?;
        ctx.write_tree(&doc_root, &nodes).await?;

        Ok(ParseResult {
            temp_dir_uri: temp_root,
            source_format: "text".to_string(),
            parser_name: self.name().to_string(),
            parse_duration_ms: started.elapsed().as_millis() as u64,
            meta: json!({
                "sections": nodes.len(),
                "tokens": ctx.token_counter.count(&text),
            }),
        })
    }
}
