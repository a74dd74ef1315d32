//! Structural code skeleton extraction.
//!
//! For supported languages the skeleton (module doc, imports, type and
//! function signatures with first-line docstrings) stands in for an LLM
//! abstract. Extraction is line-oriented and intentionally forgiving: any
//! file it cannot make sense of yields `None` and the caller falls back to
//! LLM summarisation.

use regex::Regex;
use std::sync::OnceLock;

/// Files shorter than this always take the LLM path.
pub const SKELETON_MIN_LINES: usize = 100;

/// Enumerates languages with skeleton support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeLanguage {
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    Java,
    C,
    Cpp,
}

impl CodeLanguage {
    /// Maps a file extension (without dot, any case) to a language.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "py" | "pyi" => Some(Self::Python),
            "js" | "mjs" | "cjs" | "jsx" => Some(Self::JavaScript),
            "ts" | "tsx" => Some(Self::TypeScript),
            "rs" => Some(Self::Rust),
            "go" => Some(Self::Go),
            "java" => Some(Self::Java),
            "c" | "h" => Some(Self::C),
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => Some(Self::Cpp),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
        }
    }
}

/// Returns true for extensions the code parser claims.
pub fn is_code_extension(extension: &str) -> bool {
    CodeLanguage::from_extension(extension).is_some()
}

/// Extracts a structural skeleton, or `None` when nothing useful was found.
pub fn extract_skeleton(language: CodeLanguage, source: &str) -> Option<String> {
    let lines: Vec<&str> = source.lines().collect();
    let (imports, declarations) = match language {
        CodeLanguage::Python => extract_python(&lines),
        CodeLanguage::JavaScript | CodeLanguage::TypeScript => extract_js_ts(&lines),
        CodeLanguage::Rust => extract_rust(&lines),
        CodeLanguage::Go => extract_go(&lines),
        CodeLanguage::Java => extract_java(&lines),
        CodeLanguage::C | CodeLanguage::Cpp => extract_c_like(&lines),
    };

    // Imports alone do not describe a file; callers fall back to the LLM.
    if declarations.is_empty() {
        return None;
    }

    let mut out = Vec::new();
    if !imports.is_empty() {
        out.extend(imports);
        out.push(String::new());
    }
    out.extend(declarations);
    Some(out.join("\n"))
}

fn first_docstring_line(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start();
    let body = trimmed
        .strip_prefix("\"\"\"")
        .or_else(|| trimmed.strip_prefix("'''"))?;
    let first = body
        .trim_end_matches("\"\"\"")
        .trim_end_matches("'''")
        .trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

fn extract_python(lines: &[&str]) -> (Vec<String>, Vec<String>) {
    let mut imports = Vec::new();
    let mut declarations = Vec::new();

    if let Some(first) = lines
        .iter()
        .map(|line| line.trim())
        .find(|line| !line.is_empty() && !line.starts_with('#'))
    {
        if let Some(doc) = first_docstring_line(first) {
            declarations.push(format!("# {doc}"));
        }
    }

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if indent == 0 && (trimmed.starts_with("import ") || trimmed.starts_with("from ")) {
            imports.push(line.trim_end().to_string());
            continue;
        }
        let is_class = trimmed.starts_with("class ") && indent == 0;
        let is_def = (trimmed.starts_with("def ") || trimmed.starts_with("async def "))
            && indent <= 4;
        if !is_class && !is_def {
            continue;
        }
        declarations.push(line.trim_end().to_string());
        // First docstring line directly under the signature.
        if let Some(next) = lines
            .iter()
            .skip(index + 1)
            .map(|line| line.trim())
            .find(|line| !line.is_empty())
        {
            if let Some(doc) = first_docstring_line(next) {
                declarations.push(format!("{}# {doc}", " ".repeat(indent + 4)));
            }
        }
    }
    (imports, declarations)
}

fn extract_js_ts(lines: &[&str]) -> (Vec<String>, Vec<String>) {
    static DECLARATION: OnceLock<Regex> = OnceLock::new();
    let declaration = DECLARATION.get_or_init(|| {
        Regex::new(
            r"^\s*(export\s+)?(default\s+)?(abstract\s+)?(async\s+)?(function\s+\w+|class\s+\w+|interface\s+\w+|type\s+\w+\s*=|enum\s+\w+|const\s+\w+\s*=\s*(async\s*)?\()",
        )
        .expect("js declaration regex")
    });

    let mut imports = Vec::new();
    let mut declarations = Vec::new();
    for line in lines {
        let trimmed = line.trim_start();
        if trimmed.starts_with("import ") {
            imports.push(line.trim_end().to_string());
            continue;
        }
        if declaration.is_match(line) {
            declarations.push(strip_body_opening(line));
        }
    }
    (imports, declarations)
}

fn extract_rust(lines: &[&str]) -> (Vec<String>, Vec<String>) {
    static DECLARATION: OnceLock<Regex> = OnceLock::new();
    let declaration = DECLARATION.get_or_init(|| {
        Regex::new(
            r"^\s*(pub(\([^)]*\))?\s+)?(async\s+)?(unsafe\s+)?(fn\s+\w+|struct\s+\w+|enum\s+\w+|trait\s+\w+|impl\b|mod\s+\w+|type\s+\w+)",
        )
        .expect("rust declaration regex")
    });

    let mut imports = Vec::new();
    let mut declarations = Vec::new();
    let mut pending_doc: Option<String> = None;
    for line in lines {
        let trimmed = line.trim_start();
        if trimmed.starts_with("use ") && line.starts_with("use ") {
            imports.push(line.trim_end().to_string());
            pending_doc = None;
            continue;
        }
        if trimmed.starts_with("///") {
            if pending_doc.is_none() {
                pending_doc = Some(line.trim_end().to_string());
            }
            continue;
        }
        if declaration.is_match(line) {
            if let Some(doc) = pending_doc.take() {
                declarations.push(doc);
            }
            declarations.push(strip_body_opening(line));
        } else if !trimmed.is_empty() {
            pending_doc = None;
        }
    }
    (imports, declarations)
}

fn extract_go(lines: &[&str]) -> (Vec<String>, Vec<String>) {
    let mut imports = Vec::new();
    let mut declarations = Vec::new();
    let mut in_import_block = false;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("package ") {
            declarations.push(trimmed.to_string());
            continue;
        }
        if trimmed.starts_with("import (") {
            in_import_block = true;
            continue;
        }
        if in_import_block {
            if trimmed == ")" {
                in_import_block = false;
            } else if !trimmed.is_empty() {
                imports.push(format!("import {trimmed}"));
            }
            continue;
        }
        if trimmed.starts_with("import ") {
            imports.push(trimmed.to_string());
            continue;
        }
        if trimmed.starts_with("func ") || trimmed.starts_with("type ") {
            declarations.push(strip_body_opening(line));
        }
    }
    (imports, declarations)
}

fn extract_java(lines: &[&str]) -> (Vec<String>, Vec<String>) {
    static MEMBER: OnceLock<Regex> = OnceLock::new();
    let member = MEMBER.get_or_init(|| {
        Regex::new(
            r"^\s*(public|protected|private|static|final|abstract)[\w\s<>\[\],\.]*\([^;]*\)\s*(\{|throws|;)?\s*$",
        )
        .expect("java member regex")
    });

    let mut imports = Vec::new();
    let mut declarations = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("package ") || trimmed.starts_with("import ") {
            imports.push(trimmed.to_string());
            continue;
        }
        let is_type = trimmed.contains("class ")
            || trimmed.contains("interface ")
            || trimmed.contains("enum ");
        if (is_type && !trimmed.starts_with("//")) || member.is_match(line) {
            declarations.push(strip_body_opening(line));
        }
    }
    (imports, declarations)
}

fn extract_c_like(lines: &[&str]) -> (Vec<String>, Vec<String>) {
    static FUNCTION: OnceLock<Regex> = OnceLock::new();
    let function = FUNCTION.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][\w\s\*:<>,&]*\([^;]*\)\s*\{?\s*$").expect("c function regex")
    });
    const CONTROL_KEYWORDS: [&str; 6] = ["if", "for", "while", "switch", "return", "else"];

    let mut imports = Vec::new();
    let mut declarations = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("#include") {
            imports.push(trimmed.to_string());
            continue;
        }
        if trimmed.starts_with("struct ")
            || trimmed.starts_with("class ")
            || trimmed.starts_with("typedef ")
            || trimmed.starts_with("namespace ")
        {
            declarations.push(strip_body_opening(line));
            continue;
        }
        // Function definitions start at column zero and are not control flow.
        if !line.starts_with(char::is_whitespace) && function.is_match(line) {
            let keyword = trimmed.split(['(', ' ']).next().unwrap_or_default();
            if !CONTROL_KEYWORDS.contains(&keyword) {
                declarations.push(strip_body_opening(line));
            }
        }
    }
    (imports, declarations)
}

fn strip_body_opening(line: &str) -> String {
    line.trim_end()
        .trim_end_matches('{')
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_module(line_count: usize) -> String {
        let mut lines = vec![
            "\"\"\"Billing helpers for the invoice service.\"\"\"".to_string(),
            "import os".to_string(),
            "from decimal import Decimal".to_string(),
            "".to_string(),
            "class InvoiceLedger(BaseLedger):".to_string(),
            "    \"\"\"Tracks invoice line items.\"\"\"".to_string(),
            "    def add_line(self, amount):".to_string(),
            "        \"\"\"Appends one line item.\"\"\"".to_string(),
            "        self.lines.append(amount)".to_string(),
            "".to_string(),
            "def total(ledger):".to_string(),
            "    return sum(ledger.lines)".to_string(),
        ];
        while lines.len() < line_count {
            lines.push(format!("# filler {}", lines.len()));
        }
        lines.join("\n")
    }

    #[test]
    fn python_skeleton_keeps_imports_signatures_and_docstrings() {
        let source = python_module(120);
        let skeleton =
            extract_skeleton(CodeLanguage::Python, &source).expect("python skeleton");
        assert!(skeleton.contains("import os"));
        assert!(skeleton.contains("class InvoiceLedger(BaseLedger):"));
        assert!(skeleton.contains("def add_line(self, amount):"));
        assert!(skeleton.contains("# Appends one line item."));
        assert!(skeleton.contains("# Billing helpers for the invoice service."));
        assert!(!skeleton.contains("self.lines.append"));
    }

    #[test]
    fn rust_skeleton_collects_items_with_docs() {
        let source = r#"use std::collections::BTreeMap;

/// Holds counters per key.
pub struct CounterMap {
    inner: BTreeMap<String, u64>,
}

impl CounterMap {
    /// Adds one to the named counter.
    pub fn bump(&mut self, key: &str) {
        *self.inner.entry(key.to_string()).or_default() += 1;
    }
}
"#;
        let skeleton = extract_skeleton(CodeLanguage::Rust, source).expect("rust skeleton");
        assert!(skeleton.contains("use std::collections::BTreeMap;"));
        assert!(skeleton.contains("pub struct CounterMap"));
        assert!(skeleton.contains("/// Adds one to the named counter."));
        assert!(skeleton.contains("pub fn bump(&mut self, key: &str)"));
        assert!(!skeleton.contains("or_default"));
    }

    #[test]
    fn go_skeleton_handles_import_blocks() {
        let source = "package ledger\n\nimport (\n\t\"fmt\"\n\t\"sort\"\n)\n\ntype Entry struct {\n\tAmount int\n}\n\nfunc Sum(entries []Entry) int {\n\treturn 0\n}\n";
        let skeleton = extract_skeleton(CodeLanguage::Go, source).expect("go skeleton");
        assert!(skeleton.contains("package ledger"));
        assert!(skeleton.contains("import \"fmt\""));
        assert!(skeleton.contains("func Sum(entries []Entry) int"));
    }

    #[test]
    fn declaration_free_files_yield_none() {
        let source = "x = 1\ny = 2\nprint(x + y)\n";
        assert!(extract_skeleton(CodeLanguage::Python, source).is_none());
    }

    #[test]
    fn extension_mapping_covers_supported_languages() {
        assert_eq!(CodeLanguage::from_extension("py"), Some(CodeLanguage::Python));
        assert_eq!(CodeLanguage::from_extension("RS"), Some(CodeLanguage::Rust));
        assert_eq!(CodeLanguage::from_extension("tsx"), Some(CodeLanguage::TypeScript));
        assert_eq!(CodeLanguage::from_extension("md"), None);
        assert!(is_code_extension("go"));
        assert!(!is_code_extension("toml"));
    }
}
