//! Container log access.
//!
//! Detached containers write stdout and stderr to
//! `<containers>/<name>/container.log`; foreground containers share the
//! caller's terminal and leave no log.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};

/// Reads the log at `path`, optionally only its last `tail` lines.
///
/// Returns an empty string if the log file does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(path: &Path, tail: Option<usize>) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    let content = std::fs::read_to_string(path).map_err(BurrowError::io(path))?;
    Ok(match tail {
        Some(n) => last_lines(&content, n),
        None => content,
    })
}

fn last_lines(content: &str, n: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() && content.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_logs_missing_file_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = read_logs(&dir.path().join("container.log"), None).expect("should succeed");
        assert!(content.is_empty());
    }

    #[test]
    fn read_logs_returns_whole_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("container.log");
        std::fs::write(&path, "line one\nline two\n").expect("write");
        assert_eq!(read_logs(&path, None).expect("read"), "line one\nline two\n");
    }

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("container.log");
        std::fs::write(&path, "a\nb\nc\n").expect("write");
        assert_eq!(read_logs(&path, Some(2)).expect("read"), "b\nc\n");
        assert_eq!(read_logs(&path, Some(10)).expect("read"), "a\nb\nc\n");
        assert_eq!(read_logs(&path, Some(0)).expect("read"), "");
    }
}
