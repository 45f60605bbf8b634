//! Shared utility functions for the conductor crate.

use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

/// Write `bytes` to `path` via a sibling temp file and rename, so readers see
/// either the old document or the new one, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let tmp = parent.join(format!(".{}.tmp", file_name));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

static COUNT_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+)\s*$").unwrap());

const ISSUE_KEYS: &[&str] = &["issues_remaining", "issues", "total_issues", "count"];

/// Read an issue count from scanner output.
///
/// Accepted forms, in order: a JSON object carrying one of
/// `issues_remaining`/`issues`/`total_issues`/`count` (number, or an array whose
/// length is the count), or a line holding nothing but an integer (the last
/// such line wins). Integers embedded in prose, such as tool versions or
/// timings, are never read as a count; that output yields `None`.
pub fn parse_issue_count(output: &str) -> Option<u64> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(json) = extract_json_object(trimmed)
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&json)
    {
        for key in ISSUE_KEYS {
            match value.get(key) {
                Some(serde_json::Value::Number(n)) => {
                    if let Some(count) = n.as_u64() {
                        return Some(count);
                    }
                }
                Some(serde_json::Value::Array(items)) => return Some(items.len() as u64),
                _ => {}
            }
        }
    }

    if let Ok(n) = trimmed.parse::<u64>() {
        return Some(n);
    }

    COUNT_LINE
        .captures_iter(trimmed)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the JSON: {"key": "value"}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_unbalanced() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("no json"), None);
    }

    #[test]
    fn test_parse_issue_count_json_key() {
        assert_eq!(parse_issue_count(r#"{"issues_remaining": 12}"#), Some(12));
        assert_eq!(
            parse_issue_count("scan complete\n{\"total_issues\": 4, \"files\": 9}"),
            Some(4)
        );
    }

    #[test]
    fn test_parse_issue_count_json_array() {
        assert_eq!(
            parse_issue_count(r#"{"issues": [{"id": 1}, {"id": 2}]}"#),
            Some(2)
        );
    }

    #[test]
    fn test_parse_issue_count_plain_number() {
        assert_eq!(parse_issue_count("  0\n"), Some(0));
        assert_eq!(parse_issue_count("scanning src/\n17\n"), Some(17));
    }

    #[test]
    fn test_parse_issue_count_none() {
        assert_eq!(parse_issue_count(""), None);
        assert_eq!(parse_issue_count("all clean"), None);
    }

    #[test]
    fn test_parse_issue_count_ignores_numbers_in_prose() {
        assert_eq!(parse_issue_count("Found 12 issues (ruff 0.4.0)"), None);
        assert_eq!(parse_issue_count("Found 3 files, 17 issues"), None);
        assert_eq!(parse_issue_count("7 issues\nfinished in 3.2s"), None);
        assert_eq!(parse_issue_count("ruff 0.4.0\n12\ndone in 2s"), Some(12));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
