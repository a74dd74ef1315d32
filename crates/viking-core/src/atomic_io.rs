//! Atomic file-write helpers.
//!
//! Writers stage content into a sibling temp file and rename it into place so
//! readers never observe partial data. Used by AGFS node writes, queue job
//! records, and session state snapshots.

use std::io::{self, Write};
use std::path::Path;

use crate::time_utils::current_unix_timestamp;

/// Writes bytes using a temp file + rename so readers never observe partial data.
pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "destination path cannot be empty",
        ));
    }
    if path.exists() && path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("destination path '{}' is a directory", path.display()),
        ));
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)?;

    let temp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("viking-node"),
        std::process::id(),
        current_unix_timestamp()
    );
    let temp_path = parent_dir.join(temp_name);
    std::fs::write(&temp_path, content)?;
    if let Err(error) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(error);
    }
    Ok(())
}

/// Writes a text file atomically. See [`write_bytes_atomic`].
pub fn write_text_atomic(path: &Path, content: &str) -> io::Result<()> {
    write_bytes_atomic(path, content.as_bytes())
}

/// Appends one line to a JSONL file, creating parent directories on demand.
///
/// The caller is responsible for `line` being a single serialized JSON value
/// without embedded newlines.
pub fn append_jsonl_line(path: &Path, line: &str) -> io::Result<()> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::{append_jsonl_line, write_bytes_atomic, write_text_atomic};

    #[test]
    fn atomic_write_replaces_previous_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("nested/state.json");
        write_text_atomic(&path, "{\"v\":1}").expect("first write");
        write_text_atomic(&path, "{\"v\":2}").expect("second write");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"v\":2}");
    }

    #[test]
    fn atomic_write_rejects_directory_destination() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let error = write_bytes_atomic(tempdir.path(), b"x").expect_err("must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn append_jsonl_line_appends_in_order() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("log.jsonl");
        append_jsonl_line(&path, "{\"n\":1}").expect("append");
        append_jsonl_line(&path, "{\"n\":2}").expect("append");
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"n\":1}\n{\"n\":2}\n");
    }
}
