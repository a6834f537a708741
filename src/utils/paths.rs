//! Canonical cache-path arithmetic.
//!
//! Cache paths are POSIX-style strings. The root is the empty string and
//! every descendant starts with `/`, so `"" + "/src" + "/src/app.rs"` form
//! one lineage. All helpers here are pure and synchronous.

/// Joins a child name onto a parent cache path.
pub fn join_child(parent: &str, name: &str) -> String {
    format!("{}/{}", parent, name)
}

/// Returns the parent cache path, or `None` for the root.
pub fn parent_of(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    path.rfind('/').map(|idx| path[..idx].to_string())
}

/// Returns the last path segment. The root has the empty name.
pub fn name_of(path: &str) -> &str {
    path.rfind('/').map_or(path, |idx| &path[idx + 1..])
}

/// Distance from the root (root = 0).
pub fn depth_of(path: &str) -> u32 {
    path.split('/').filter(|seg| !seg.is_empty()).count() as u32
}

/// True iff `path` equals `ancestor` or lies inside its subtree.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor || path.starts_with(&format!("{}/", ancestor))
}

/// Iterates the non-empty segments of a cache path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|seg| !seg.is_empty())
}
