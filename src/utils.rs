//! Utility functions for reading link lists.

use crate::error::ValidatorError;
use std::path::Path;

/// Read and split a link file. The file is read once and never modified.
pub fn read_link_file(path: impl AsRef<Path>) -> Result<Vec<String>, ValidatorError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ValidatorError::Input {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_link_list(&content))
}

/// Split text content into candidate links, one per non-blank line.
pub fn parse_link_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim().trim_start_matches('\u{feff}'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_dropped() {
        let content = "\u{feff}vmess://abc\n\n  trojan://pw@h:1  \r\n\t\nnot-a-link\n";
        assert_eq!(
            parse_link_list(content),
            vec!["vmess://abc", "trojan://pw@h:1", "not-a-link"]
        );
    }

    #[test]
    fn missing_input_is_fatal() {
        let err = read_link_file("/nonexistent/links.txt").unwrap_err();
        assert!(matches!(err, ValidatorError::Input { .. }));
        assert!(err.to_string().contains("/nonexistent/links.txt"));
    }
}
