//! Exclusion filtering for sync-relevant paths.
//!
//! Patterns are glob-like: `**` matches any sequence of characters
//! including path separators, `*` matches within a single segment. A path
//! is excluded when ANY configured pattern matches. The filter gates every
//! sync operation in both directions, so an excluded path neither reaches
//! the remote store nor gets recreated locally from a stale remote record.
//!
//! Patterns are compiled once when the filter is built, not per evaluation.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExclusionError {
    #[error("Invalid exclusion pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },
}

/// A compiled set of exclusion patterns.
#[derive(Debug, Clone)]
pub struct ExclusionFilter {
    set: GlobSet,
    patterns: Vec<String>,
}

impl ExclusionFilter {
    /// A filter that excludes nothing.
    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    /// Compile a pattern list into a reusable matcher set.
    pub fn new(patterns: &[String]) -> Result<Self, ExclusionError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|source| ExclusionError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|source| ExclusionError::InvalidPattern {
                pattern: patterns.join(", "),
                source,
            })?;
        Ok(Self {
            set,
            patterns: patterns.to_vec(),
        })
    }

    /// True when any pattern matches the path.
    pub fn matches(&self, path: &str) -> bool {
        self.set.is_match(path)
    }

    /// The patterns this filter was built from.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for ExclusionFilter {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> ExclusionFilter {
        let owned: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        ExclusionFilter::new(&owned).unwrap()
    }

    #[test]
    fn test_empty_excludes_nothing() {
        let f = ExclusionFilter::empty();
        assert!(!f.matches("anything.md"));
        assert!(!f.matches(".obsidian/config"));
    }

    #[test]
    fn test_double_star_crosses_separators() {
        let f = filter(&[".obsidian/**"]);
        assert!(f.matches(".obsidian/config"));
        assert!(f.matches(".obsidian/plugins/sync/data.json"));
        assert!(!f.matches("notes/a.md"));
        assert!(!f.matches(".obsidian")); // the directory itself, not under it
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let f = filter(&["drafts/*.md"]);
        assert!(f.matches("drafts/a.md"));
        assert!(!f.matches("drafts/sub/a.md"));
        assert!(!f.matches("a.md"));
    }

    #[test]
    fn test_any_pattern_excludes() {
        let f = filter(&["*.tmp", "trash/**"]);
        assert!(f.matches("note.tmp"));
        assert!(f.matches("trash/old.md"));
        assert!(!f.matches("note.md"));
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let patterns = vec!["[".to_string()];
        assert!(ExclusionFilter::new(&patterns).is_err());
    }
}
