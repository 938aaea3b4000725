//! Path helpers for the `/`-separated logical paths used throughout sync.
//!
//! Vault paths are always relative, with `/` as the separator on every
//! platform (the host filesystem adapters translate).

/// Rewrite `path` from under `old_prefix` to under `new_prefix`.
///
/// Returns `None` when the path is not separator-bounded under the old
/// prefix: `Notes` matches `Notes/a.md` but neither `NotesArchive/c.md`
/// nor the path `Notes` itself. Trailing separators on either prefix are
/// tolerated.
pub fn rebase_prefix(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    let old = old_prefix.trim_end_matches('/');
    let rest = path.strip_prefix(old)?.strip_prefix('/')?;
    Some(format!("{}/{}", new_prefix.trim_end_matches('/'), rest))
}

/// The ancestor directories of a path, top-down, excluding the path itself.
///
/// `ancestors("a/b/c.md")` yields `["a", "a/b"]`; a bare filename has none.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut prefix = String::new();
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        out.push(prefix.clone());
    }
    out
}
