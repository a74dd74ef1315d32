//! Streamed content and path search over AGFS leaves.
//!
//! `grep` is not indexed: it walks leaf files under the target and matches
//! lines as it goes. `glob` enumerates paths against a shell-style pattern.

use regex::RegexBuilder;
use serde::Serialize;
use viking_agfs::{Agfs, LsOptions};
use viking_core::{VikingError, VikingResult, VikingUri};

/// Matches are capped so a runaway pattern cannot balloon a response.
pub const GREP_MAX_MATCHES: usize = 1_000;

/// One grep hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrepMatch {
    pub uri: VikingUri,
    pub line_number: usize,
    pub line: String,
}

/// Regex search over leaf file contents under `target`.
pub async fn grep(
    agfs: &Agfs,
    pattern: &str,
    target: &VikingUri,
    case_insensitive: bool,
) -> VikingResult<Vec<GrepMatch>> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|error| VikingError::invalid_argument(format!("bad pattern: {error}")))?;

    let entries = agfs
        .ls(
            target,
            LsOptions {
                recursive: true,
                include_hidden: false,
                node_limit: None,
            },
        )
        .await?;

    let mut matches = Vec::new();
    'files: for entry in entries.iter().filter(|entry| !entry.is_dir) {
        let bytes = match agfs.read(&entry.uri).await {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        let Ok(text) = String::from_utf8(bytes) else {
            continue;
        };
        for (index, line) in text.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            matches.push(GrepMatch {
                uri: entry.uri.clone(),
                line_number: index + 1,
                line: line.to_string(),
            });
            if matches.len() >= GREP_MAX_MATCHES {
                break 'files;
            }
        }
    }
    Ok(matches)
}

/// Shell-style path enumeration under `target`. Patterns support `*`
/// (within a segment), `**` (across segments), and `?`.
pub async fn glob(
    agfs: &Agfs,
    pattern: &str,
    target: &VikingUri,
) -> VikingResult<Vec<VikingUri>> {
    let regex = glob_to_regex(pattern)?;
    let entries = agfs
        .ls(
            target,
            LsOptions {
                recursive: true,
                include_hidden: false,
                node_limit: None,
            },
        )
        .await?;

    let prefix = if target.is_root() {
        String::new()
    } else {
        format!("{}/", target.storage_path())
    };
    Ok(entries
        .into_iter()
        .filter(|entry| {
            let path = entry.uri.storage_path();
            let relative = path.strip_prefix(&prefix).unwrap_or(path);
            regex.is_match(relative)
        })
        .map(|entry| entry.uri)
        .collect())
}

fn glob_to_regex(pattern: &str) -> VikingResult<regex::Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(character) = chars.next() {
        match character {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` also matches zero directories.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            character => out.push_str(&regex::escape(&character.to_string())),
        }
    }
    out.push('$');
    regex::Regex::new(&out)
        .map_err(|error| VikingError::invalid_argument(format!("bad glob pattern: {error}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use viking_agfs::{MemoryBackend, WriteOptions};

    use super::*;

    async fn seeded() -> Agfs {
        let agfs = Agfs::new(Arc::new(MemoryBackend::new()));
        agfs.init_scope_roots().await.expect("init");
        for (path, body) in [
            ("viking://resources/doc/A.md", "alpha line\nsearch target here"),
            ("viking://resources/doc/B.md", "beta line"),
            ("viking://resources/doc/sub/C.txt", "gamma Target"),
        ] {
            agfs.write(
                &VikingUri::parse(path).expect("uri"),
                body.as_bytes(),
                WriteOptions {
                    create_only: false,
                    create_parents: true,
                },
            )
            .await
            .expect("seed");
        }
        agfs
    }

    #[tokio::test]
    async fn grep_reports_uri_line_number_and_line() {
        let agfs = seeded().await;
        let target = VikingUri::parse("viking://resources").expect("uri");
        let matches = grep(&agfs, "target", &target, false).await.expect("grep");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].uri.as_str(), "viking://resources/doc/A.md");
        assert_eq!(matches[0].line_number, 2);

        let insensitive = grep(&agfs, "target", &target, true).await.expect("grep");
        assert_eq!(insensitive.len(), 2);
    }

    #[tokio::test]
    async fn grep_rejects_invalid_patterns() {
        let agfs = seeded().await;
        let target = VikingUri::parse("viking://resources").expect("uri");
        let error = grep(&agfs, "(", &target, false).await.expect_err("bad");
        assert_eq!(error.code, viking_core::ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn glob_matches_segments_and_crosses_them_with_doublestar() {
        let agfs = seeded().await;
        let target = VikingUri::parse("viking://resources/doc").expect("uri");

        let single = glob(&agfs, "*.md", &target).await.expect("glob");
        let names: Vec<&str> = single.iter().filter_map(|uri| uri.name()).collect();
        assert_eq!(names, vec!["A.md", "B.md"]);

        let all = glob(&agfs, "**/*.txt", &target).await.expect("glob");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), Some("C.txt"));
    }
}
