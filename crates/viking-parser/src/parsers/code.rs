//! Code parser: stores source files whole; skeleton extraction happens at
//! summarisation time.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use viking_core::{VikingError, VikingResult, VikingUri};

use crate::registry::Parser;
use crate::skeleton::{is_code_extension, CodeLanguage};
use crate::split::sanitize_name;
use crate::types::{ParseContext, ParseInput, ParseResult};

/// Parser for source code files.
#[derive(Debug, Default)]
pub struct CodeParser;

#[async_trait]
impl Parser for CodeParser {
    fn name(&self) -> &'static str {
        "code"
    }

    fn can_handle(&self, input: &ParseInput, _bytes: &[u8]) -> bool {
        input
            .extension()
            .map(|extension| is_code_extension(&extension))
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
                "'{}' is not valid UTF-8 source code",
                input.file_name()
            ))
        })?;
        let language = input
            .extension()
            .and_then(|extension| CodeLanguage::from_extension(&extension))
            .ok_or_else(|| {
                VikingError::unsupported_format(format!(
                    "'{}' has no supported code extension",
                    input.file_name()
                ))
            })?;

        let stem = sanitize_name(&input.stem());
        let temp_root = VikingUri::new_temp_root();
        let doc_root = temp_root.join(&stem)?;
        ctx.agfs.mkdirp(&doc_root).await?;
        ctx.agfs
            .write(
                &doc_root.join(&sanitize_name(&input.file_name()))?,
                bytes,
                viking_agfs::WriteOptions {
                    create_only: false,
                    create_parents: true,
                },
            )
            .await?;

        Ok(ParseResult {
            temp_dir_uri: temp_root,
            source_format: "code".to_string(),
            parser_name: self.name().to_string(),
            parse_duration_ms: started.elapsed().as_millis() as u64,
            meta: json!({
                "language": language.label(),
                "lines": text.lines().count(),
            }),
        })
    }
}
