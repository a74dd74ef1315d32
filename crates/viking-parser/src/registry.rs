//! Parser registry.
//!
//! Parsers are scanned in registration order; the first whose capability
//! check accepts the input wins. Inputs nothing claims are rejected with
//! `UNSUPPORTED_FORMAT`.

use async_trait::async_trait;
use viking_core::{VikingError, VikingResult};

use crate::parsers::{CodeParser, MarkdownParser, TextParser};
use crate::types::{ParseContext, ParseInput, ParseResult};

/// Capability contract every format parser implements.
#[async_trait]
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap acceptance check over the input name and raw bytes.
    fn can_handle(&self, input: &ParseInput, bytes: &[u8]) -> bool;

    /// Converts the input into a canonical scratch tree.
    async fn parse(
        &self,
        input: &ParseInput,
        bytes: &[u8],
        ctx: &ParseContext,
    ) -> VikingResult<ParseResult>;
}

/// Ordered collection of format parsers.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
}

impl ParserRegistry {
    /// Empty registry; callers register parsers in priority order.
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Registry with the built-in parsers: markdown, code, then the plain
    /// text fallback.
    pub fn with_default_parsers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(MarkdownParser));
        registry.register(Box::new(CodeParser));
        registry.register(Box::new(TextParser));
        registry
    }

    pub fn register(&mut self, parser: Box<dyn Parser>) {
        self.parsers.push(parser);
    }

    /// Dispatches an input to the first accepting parser.
    pub async fn parse(
        &self,
        input: &ParseInput,
        ctx: &ParseContext,
    ) -> VikingResult<ParseResult> {
        let bytes = input.load()?;
        for parser in &self.parsers {
            if !parser.can_handle(input, &bytes) {
                continue;
            }
            tracing::debug!(parser = parser.name(), input = %input.file_name(), "parsing input");
            return parser.parse(input, &bytes, ctx).await;
        }
        Err(VikingError::unsupported_format(format!(
            "no parser matches '{}'",
            input.file_name()
        )))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_default_parsers()
    }
}
