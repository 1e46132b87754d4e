//! Source-list line format: comment/escape-aware parsing and raw mode

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::Result;

/// Process one physical line of a source list.
///
/// Parsed mode strips `#` comments (unless quoted or escaped as `\#`),
/// unescapes `\#`, trims surrounding whitespace and drops blank results.
/// Raw mode returns every physical line verbatim, 1:1 with file lines --
/// including blank ones; that asymmetry is deliberate.
pub fn process_line(line: &str, raw_values: bool) -> Option<String> {
    if raw_values {
        return Some(line.to_string());
    }
    let stripped = strip_comment(line);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Remove a `#` comment running to end-of-line.
///
/// A `#` inside a double-quoted span does not start a comment; `\#` outside
/// quotes is unescaped to a literal `#`.
fn strip_comment(line: &str) -> String {
    let mut result = String::with_capacity(line.len());
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                result.push(c);
            }
            '\\' if !in_quotes && chars.peek() == Some(&'#') => {
                chars.next();
                result.push('#');
            }
            '#' if !in_quotes => break,
            _ => result.push(c),
        }
    }
    result
}

/// Extract the first CSV field of a line (Excel dialect).
///
/// A leading double quote opens a quoted field where `""` is a literal
/// quote; otherwise the field runs to the first comma.
pub fn first_csv_field(line: &str) -> String {
    let line = line.trim_start();
    if let Some(rest) = line.strip_prefix('"') {
        let mut field = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    break;
                }
            } else {
                field.push(c);
            }
        }
        field
    } else {
        match line.find(',') {
            Some(pos) => line[..pos].to_string(),
            None => line.to_string(),
        }
    }
}

/// Read a source list file, applying `process_line` per the mode.
///
/// Returns `(row_number, value)` pairs; row numbers are 1-based physical
/// line numbers so failures can be traced back to the file.
pub async fn read_list_file(path: &Path, raw_values: bool) -> Result<Vec<(u64, String)>> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut entries = Vec::new();
    let mut row = 0u64;
    while let Some(line) = lines.next_line().await? {
        row += 1;
        if let Some(value) = process_line(&line, raw_values) {
            entries.push((row, value));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_lines_skipped_in_parsed_mode() {
        assert_eq!(process_line("", false), None);
        assert_eq!(process_line("   \t ", false), None);
        assert_eq!(process_line("# just a comment", false), None);
    }

    #[test]
    fn test_comment_stripped() {
        assert_eq!(
            process_line("path/to/object # trailing note", false),
            Some("path/to/object".to_string())
        );
    }

    #[test]
    fn test_hash_inside_quotes_kept() {
        assert_eq!(
            process_line("\"weird#name\",extra # comment", false),
            Some("\"weird#name\",extra".to_string())
        );
    }

    #[test]
    fn test_escaped_hash_unescapes() {
        assert_eq!(
            process_line("file\\#1 # comment", false),
            Some("file#1".to_string())
        );
    }

    #[test]
    fn test_whitespace_trimmed() {
        assert_eq!(
            process_line("  spaced/path  ", false),
            Some("spaced/path".to_string())
        );
    }

    #[test]
    fn test_raw_mode_is_verbatim_including_blanks() {
        // Raw mode keeps lines 1:1 with the file; blank lines are NOT
        // filtered the way parsed mode filters them
        assert_eq!(process_line("", true), Some(String::new()));
        assert_eq!(
            process_line("  raw # not a comment ", true),
            Some("  raw # not a comment ".to_string())
        );
        assert_eq!(
            process_line("file\\#1", true),
            Some("file\\#1".to_string())
        );
    }

    #[test]
    fn test_first_csv_field() {
        assert_eq!(first_csv_field("plain"), "plain");
        assert_eq!(first_csv_field("a,b,c"), "a");
        assert_eq!(first_csv_field("\"quoted,with comma\",b"), "quoted,with comma");
        assert_eq!(first_csv_field("\"doubled\"\"quote\",b"), "doubled\"quote");
    }

    #[tokio::test]
    async fn test_read_list_file_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        tokio::fs::write(&path, "one\n\n# comment\ntwo # note\n  three  \n")
            .await
            .unwrap();

        let parsed = read_list_file(&path, false).await.unwrap();
        assert_eq!(
            parsed,
            vec![
                (1, "one".to_string()),
                (4, "two".to_string()),
                (5, "three".to_string()),
            ]
        );

        let raw = read_list_file(&path, true).await.unwrap();
        assert_eq!(raw.len(), 5);
        assert_eq!(raw[1], (2, String::new()));
        assert_eq!(raw[3], (4, "two # note".to_string()));
    }
}
