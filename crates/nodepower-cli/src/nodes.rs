//! Node selection.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parses a node file: one node per line, `#` starts a comment.
pub fn parse_node_file(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Reads and parses a node file.
pub fn load_node_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read node file {}", path.display()))?;
    Ok(parse_node_file(&content))
}

/// Concatenates node lists, dropping repeats and keeping first occurrences.
pub fn merge<'a, I>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut merged: Vec<String> = Vec::new();
    for node in lists.into_iter().flatten() {
        if !merged.contains(node) {
            merged.push(node.clone());
        }
    }
    merged
}
