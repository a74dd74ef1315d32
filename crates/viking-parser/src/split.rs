//! Header-based document splitting.
//!
//! Converts markdown-like text into the canonical tree shape: one file when
//! the document fits the token limit, otherwise sections at the highest
//! header level that yields more than one, with small sections merged into
//! their next sibling and oversized sections recursing into subdirectories.

use crate::token::TokenCounter;

/// Token thresholds driving the splitter.
#[derive(Debug, Clone, Copy)]
pub struct SplitLimits {
    pub split_token_limit: usize,
    pub merge_token_floor: usize,
}

impl Default for SplitLimits {
    fn default() -> Self {
        Self {
            split_token_limit: 1024,
            merge_token_floor: 512,
        }
    }
}

/// One node of a canonical scratch tree, before it is written to AGFS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocNode {
    File { name: String, content: String },
    Dir { name: String, children: Vec<DocNode> },
}

impl DocNode {
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Dir { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
struct Section {
    title: String,
    content: String,
}

/// Splits a document into the children of its root directory.
pub fn split_document(
    title: &str,
    text: &str,
    counter: &dyn TokenCounter,
    limits: &SplitLimits,
) -> Vec<DocNode> {
    let nodes = split_level(title, text, 1, counter, limits);
    dedupe_names(nodes)
}

fn split_level(
    title: &str,
    text: &str,
    min_header_level: usize,
    counter: &dyn TokenCounter,
    limits: &SplitLimits,
) -> Vec<DocNode> {
    if counter.count(text) <= limits.split_token_limit {
        return vec![DocNode::File {
            name: file_name(title),
            content: text.to_string(),
        }];
    }

    for level in min_header_level..=6 {
        let sections = split_at_header_level(text, level);
        if sections.len() < 2 {
            continue;
        }
        let merged = merge_small_sections(sections, counter, limits.merge_token_floor);
        let mut children = Vec::with_capacity(merged.len());
        for section in merged {
            if counter.count(&section.content) <= limits.split_token_limit {
                children.push(DocNode::File {
                    name: file_name(&section.title),
                    content: section.content,
                });
            } else {
                let nested = split_level(
                    &section.title,
                    &section.content,
                    level + 1,
                    counter,
                    limits,
                );
                // A section that could not be split further stays a file.
                if nested.len() == 1 && matches!(nested[0], DocNode::File { .. }) {
                    children.extend(nested);
                } else {
                    children.push(DocNode::Dir {
                        name: dir_name(&section.title),
                        children: dedupe_names(nested),
                    });
                }
            }
        }
        return children;
    }

    chunk_paragraphs(text, counter, limits)
}

/// Splits at headers of exactly `level`, skipping fenced code blocks.
fn split_at_header_level(text: &str, level: usize) -> Vec<Section> {
    let marker = "#".repeat(level);
    let mut sections: Vec<Section> = Vec::new();
    let mut current_title = String::new();
    let mut current_lines: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut saw_header = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        let is_header = !in_fence
            && trimmed.starts_with(&marker)
            && trimmed[level..].starts_with(' ');
        if is_header {
            if saw_header || !current_lines.iter().all(|line| line.trim().is_empty()) {
                sections.push(Section {
                    title: section_title(&current_title, &current_lines),
                    content: current_lines.join("\n"),
                });
            }
            saw_header = true;
            current_title = trimmed[level..].trim().to_string();
            current_lines = vec![line];
        } else {
            current_lines.push(line);
        }
    }
    if saw_header {
        sections.push(Section {
            title: section_title(&current_title, &current_lines),
            content: current_lines.join("\n"),
        });
    }
    sections
}

fn section_title(header_title: &str, lines: &[&str]) -> String {
    if !header_title.is_empty() {
        return header_title.to_string();
    }
    // Preamble ahead of the first header takes its title from its first line.
    lines
        .iter()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .unwrap_or_else(|| "preamble".to_string())
}

/// Greedy left-to-right merge: a run of sections stays together until its
/// combined size reaches the floor.
fn merge_small_sections(
    sections: Vec<Section>,
    counter: &dyn TokenCounter,
    floor: usize,
) -> Vec<Section> {
    let mut merged: Vec<Section> = Vec::new();
    let mut group: Option<Section> = None;
    let mut group_tokens = 0usize;

    for section in sections {
        let tokens = counter.count(&section.content);
        match group.take() {
            None => {
                group_tokens = tokens;
                group = Some(section);
            }
            Some(mut open) => {
                if group_tokens < floor {
                    open.content.push_str("\n\n");
                    open.content.push_str(&section.content);
                    group_tokens += tokens;
                    group = Some(open);
                } else {
                    merged.push(open);
                    group_tokens = tokens;
                    group = Some(section);
                }
            }
        }
    }
    if let Some(open) = group {
        merged.push(open);
    }
    merged
}

/// Fallback for header-less text: pack paragraphs greedily up to the limit.
fn chunk_paragraphs(
    text: &str,
    counter: &dyn TokenCounter,
    limits: &SplitLimits,
) -> Vec<DocNode> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        if paragraph.trim().is_empty() {
            continue;
        }
        let candidate_tokens = counter.count(&current) + counter.count(paragraph);
        if !current.is_empty() && candidate_tokens > limits.split_token_limit {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, content)| DocNode::File {
            name: format!("part-{}.md", index + 1),
            content,
        })
        .collect()
}

/// Keeps sibling names unique by appending a numeric suffix to repeats.
fn dedupe_names(nodes: Vec<DocNode>) -> Vec<DocNode> {
    let mut seen = std::collections::HashMap::<String, usize>::new();
    nodes
        .into_iter()
        .map(|node| {
            let count = seen.entry(node.name().to_string()).or_insert(0);
            *count += 1;
            if *count == 1 {
                return node;
            }
            let suffix = *count;
            match node {
                DocNode::File { name, content } => {
                    let renamed = match name.rsplit_once('.') {
                        Some((stem, extension)) => format!("{stem}-{suffix}.{extension}"),
                        None => format!("{name}-{suffix}"),
                    };
                    DocNode::File {
                        name: renamed,
                        content,
                    }
                }
                DocNode::Dir { name, children } => DocNode::Dir {
                    name: format!("{name}-{suffix}"),
                    children,
                },
            }
        })
        .collect()
}

/// Sanitises a section title into a URI-safe node name, preserving case.
pub fn sanitize_name(title: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for character in title.chars() {
        let mapped = if character.is_alphanumeric() || matches!(character, '-' | '_' | '.') {
            Some(character)
        } else if character.is_whitespace() {
            Some('-')
        } else {
            None
        };
        match mapped {
            Some('-') if last_dash => {}
            Some(character) => {
                last_dash = character == '-';
                out.push(character);
            }
            None => {}
        }
    }
    let trimmed = out.trim_matches(|character| character == '-' || character == '.');
    let mut name: String = trimmed.chars().take(80).collect();
    if name.is_empty() {
        name = "section".to_string();
    }
    name
}

fn file_name(title: &str) -> String {
    format!("{}.md", sanitize_name(title))
}

fn dir_name(title: &str) -> String {
    sanitize_name(title)
}

#[cfg(test)]
mod tests {
    use crate::token::ApproxTokenCounter;

    use super::*;

    fn split(text: &str) -> Vec<DocNode> {
        split_document("doc", text, &ApproxTokenCounter, &SplitLimits::default())
    }

    fn words(count: usize) -> String {
        // ~8 chars per word keeps token math easy: count * 2 tokens.
        (0..count).map(|index| format!("word{index:04}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn small_documents_emit_one_file() {
        let text = format!("# Title\n\n{}", words(100));
        let nodes = split(&text);
        assert_eq!(nodes.len(), 1);
        assert!(matches!(&nodes[0], DocNode::File { name, .. } if name == "doc.md"));
    }

    #[test]
    fn exactly_at_limit_does_not_split() {
        let text = "x".repeat(4096);
        let nodes = split(&text);
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn one_token_past_limit_splits() {
        let body = words(300);
        let text = format!("# A\n{body}\n\n# B\n{body}\n\n# C\n{body}");
        assert!(ApproxTokenCounter.count(&text) > 1024);
        let nodes = split(&text);
        let names: Vec<&str> = nodes.iter().map(DocNode::name).collect();
        assert_eq!(names, vec!["A.md", "B.md", "C.md"]);
    }

    #[test]
    fn highest_header_level_with_multiple_sections_wins() {
        let body = words(300);
        // A single h1 cannot split the document; the h2 sections can. The
        // tiny preamble merges into the first h2 section.
        let text = format!("# Top\n\n## One\n{body}\n\n## Two\n{body}\n\n## Three\n{body}");
        let nodes = split(&text);
        let names: Vec<&str> = nodes.iter().map(DocNode::name).collect();
        assert_eq!(names, vec!["Top.md", "Two.md", "Three.md"]);
        match &nodes[0] {
            DocNode::File { content, .. } => assert!(content.contains("## One")),
            DocNode::Dir { .. } => panic!("merged preamble group must stay a file"),
        }
    }

    #[test]
    fn small_sections_merge_with_next_sibling() {
        let small = words(60); // ~135 tokens
        let mid = words(300); // ~675 tokens
        let big = words(400); // ~900 tokens
        let text = format!("# A\n{small}\n\n# B\n{small}\n\n# C\n{mid}\n\n# D\n{big}");
        let nodes = split(&text);
        // A and B merge below the floor, then C tops the group past it.
        let names: Vec<&str> = nodes.iter().map(DocNode::name).collect();
        assert_eq!(names, vec!["A.md", "D.md"]);
        match &nodes[0] {
            DocNode::File { content, .. } => {
                assert!(content.contains("# B"));
                assert!(content.contains("# C"));
            }
            DocNode::Dir { .. } => panic!("merged group must stay a file"),
        }
    }

    #[test]
    fn oversized_sections_recurse_into_subdirectories() {
        let body = words(400);
        let text = format!(
            "# A\n## A1\n{body}\n\n## A2\n{body}\n\n## A3\n{body}\n\n# B\n{body}"
        );
        let nodes = split(&text);
        let dir = nodes
            .iter()
            .find(|node| matches!(node, DocNode::Dir { .. }))
            .expect("oversized section becomes a directory");
        match dir {
            DocNode::Dir { name, children } => {
                assert_eq!(name, "A");
                assert!(children.len() >= 2, "children: {children:?}");
            }
            DocNode::File { .. } => unreachable!(),
        }
    }

    #[test]
    fn headerless_documents_chunk_by_paragraphs() {
        let paragraphs: Vec<String> = (0..40).map(|_| words(60)).collect();
        let text = paragraphs.join("\n\n");
        assert!(ApproxTokenCounter.count(&text) > 1024);
        let nodes = split(&text);
        assert!(nodes.len() >= 2);
        assert!(nodes.iter().all(|node| matches!(node, DocNode::File { .. })));
        assert_eq!(nodes[0].name(), "part-1.md");
    }

    #[test]
    fn fenced_header_lookalikes_do_not_split() {
        let body = words(700);
        let text = format!("```\n# not a header\n```\n\n{body}");
        let nodes = split(&text);
        assert!(
            nodes.iter().all(|node| !node.name().contains("not-a-header")),
            "fenced content must not become a section"
        );
    }

    #[test]
    fn duplicate_section_names_get_suffixes() {
        let body = words(400);
        let text = format!("# Same\n{body}\n\n# Same\n{body}");
        let nodes = split(&text);
        let names: Vec<&str> = nodes.iter().map(DocNode::name).collect();
        assert_eq!(names, vec!["Same.md", "Same-2.md"]);
    }

    #[test]
    fn sanitize_preserves_case_and_strips_punctuation() {
        assert_eq!(sanitize_name("A"), "A");
        assert_eq!(sanitize_name("Getting Started!"), "Getting-Started");
        assert_eq!(sanitize_name("..hidden"), "hidden");
        assert_eq!(sanitize_name("???"), "section");
    }
}
