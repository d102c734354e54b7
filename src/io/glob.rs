//! File globbing used by the filesystem storage backend.
//!
//! Results are always sorted so that zero-padded shard names come back in
//! numeric order.

use anyhow::{Context, Result};
use glob::{Pattern, glob};
use std::path::{Path, PathBuf};

/// Expand a glob pattern into a sorted vector of matching file paths.
///
/// Directories are skipped. A pattern that matches nothing yields an empty
/// vector, not an error.
///
/// # Pattern Syntax
///
/// Supports standard glob patterns:
/// - `*` matches any sequence of characters within a path component
/// - `?` matches any single character
/// - `**` matches zero or more directories
/// - `[abc]` matches any character in the set
///
/// # Errors
///
/// Returns an error if the pattern is invalid or a matched entry cannot be read.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;

    let mut result = Vec::new();
    for entry in paths {
        let path =
            entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.is_file() {
            result.push(path);
        }
    }

    result.sort();
    Ok(result)
}

/// Every file below `dir` (recursively), sorted.
///
/// `dir` is escaped, so bucket roots or submission ids containing glob
/// metacharacters are matched literally. A missing directory yields an
/// empty vector.
///
/// # Errors
///
/// Returns an error if `dir` is not valid UTF-8 or the walk fails.
pub fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let dir_str = dir
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("path contains invalid UTF-8: {}", dir.display()))?;
    expand_glob(&format!("{}/**/*", Pattern::escape(dir_str)))
}
