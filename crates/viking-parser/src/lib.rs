//! Input parsing for the Viking context engine.
//!
//! Every supported input is converted into a canonical scratch tree under
//! `viking://temp/<uuid>/`: one document-root directory whose children are
//! token-bounded sections. Code files are stored whole; their structural
//! skeletons are extracted at summarisation time.

pub mod parsers;
pub mod registry;
pub mod skeleton;
pub mod split;
pub mod token;
pub mod types;

pub use parsers::{CodeParser, MarkdownParser, TextParser};
pub use registry::{Parser, ParserRegistry};
pub use skeleton::{extract_skeleton, is_code_extension, CodeLanguage, SKELETON_MIN_LINES};
pub use split::{sanitize_name, split_document, DocNode, SplitLimits};
pub use token::{ApproxTokenCounter, TokenCounter};
pub use types::{ParseContext, ParseInput, ParseResult};
