//! Lexical path handling for slash-separated logical paths.
//!
//! Logical paths never touch the host filesystem, so they are handled as plain
//! strings with `/` separators regardless of platform.

/// Separator used by every logical path.
pub const SEPARATOR: char = '/';

/// Lexically cleans a path: collapses repeated separators, drops `.` segments
/// and resolves `..` against preceding segments. A rooted path never climbs
/// above `/`; a relative one keeps its leading `..` segments. An empty result
/// is `"."`.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with(SEPARATOR);
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// True if `path` carries a trailing separator, i.e. the caller means a directory.
pub fn has_dir_marker(path: &str) -> bool {
    path.ends_with(SEPARATOR)
}

/// True if the path denotes the root of a store.
pub fn is_root(path: &str) -> bool {
    matches!(path, "" | "." | "/" | "./")
}

/// Cleans and strips the leading `/`, mapping every spelling of the root to `""`.
pub fn normalize(path: &str) -> String {
    let cleaned = clean(path);
    let trimmed = cleaned.trim_start_matches(SEPARATOR);
    if trimmed == "." {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// True if a cleaned relative path climbs above its starting point.
pub fn escapes(cleaned: &str) -> bool {
    cleaned == ".." || cleaned.starts_with("../")
}

/// Joins two paths and cleans the result. An empty or root `base` yields `rel`.
pub fn join(base: &str, rel: &str) -> String {
    if base.is_empty() {
        return clean(rel);
    }
    if rel.is_empty() {
        return clean(base);
    }
    clean(&format!("{base}/{rel}"))
}

/// Leaf name of a path, ignoring any trailing separator.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Parent of a path, `""` for a top-level entry.
pub fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

/// `path` relative to `base`, or `None` if it lies outside. Both are expected
/// to be cleaned; `path == base` yields `"."`.
pub fn relative_to(base: &str, path: &str) -> Option<String> {
    if base.is_empty() {
        return Some(path.to_string());
    }
    if path == base {
        return Some(".".to_string());
    }
    path.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .map(str::to_string)
}

/// First segment of `path` whose name ends with `suffix`.
pub fn segment_ending_with<'a>(path: &'a str, suffix: &str) -> Option<&'a str> {
    path.split(SEPARATOR).find(|segment| segment.ends_with(suffix))
}

/// Appends a trailing separator unless one is already present.
pub fn with_dir_marker(path: &str) -> String {
    if has_dir_marker(path) {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clean_basic() {
        assert_eq!(clean(""), ".");
        assert_eq!(clean("a//b/./c/"), "a/b/c");
        assert_eq!(clean("a/b/../c"), "a/c");
        assert_eq!(clean("./a"), "a");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("/../a"), "/a");
        assert_eq!(clean("../a"), "../a");
        assert_eq!(clean("a/../.."), "..");
        assert_eq!(clean("a/../../b/.."), "..");
    }

    #[test]
    fn test_normalize_root_spellings() {
        for root in ["", ".", "/", "./", "//", "a/.."] {
            assert_eq!(normalize(root), "", "{root:?}");
        }
        assert_eq!(normalize("/a/b/"), "a/b");
    }

    #[test]
    fn test_escapes() {
        assert!(escapes(".."));
        assert!(escapes("../x"));
        assert!(!escapes("..x"));
        assert!(!escapes("x/.."));
    }

    #[test]
    fn test_base_name_and_parent() {
        assert_eq!(base_name("a/b/c.txt"), "c.txt");
        assert_eq!(base_name("a/b/"), "b");
        assert_eq!(base_name("top"), "top");
        assert_eq!(parent("a/b/c.txt"), "a/b");
        assert_eq!(parent("top"), "");
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("data", "data/a/b").as_deref(), Some("a/b"));
        assert_eq!(relative_to("data", "data").as_deref(), Some("."));
        assert_eq!(relative_to("data", "database/x"), None);
        assert_eq!(relative_to("", "x/y").as_deref(), Some("x/y"));
    }

    #[test]
    fn test_segment_ending_with() {
        assert_eq!(segment_ending_with("a/b.x/c", ".x"), Some("b.x"));
        assert_eq!(segment_ending_with("a/b/c.x", ".x"), Some("c.x"));
        assert_eq!(segment_ending_with("a.xy/b", ".x"), None);
        assert_eq!(segment_ending_with("", ".x"), None);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("data", "a/b"), "data/a/b");
        assert_eq!(join("data", "."), "data");
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("data", ""), "data");
    }

    proptest! {
        #[test]
        fn prop_clean_is_idempotent(segments in proptest::collection::vec("[a-c.]{0,3}", 0..8)) {
            let path = segments.join("/");
            let once = clean(&path);
            prop_assert_eq!(clean(&once), once);
        }

        #[test]
        fn prop_clean_has_no_empty_or_dot_segments(segments in proptest::collection::vec("[a-c.]{0,3}", 1..8)) {
            let cleaned = clean(&segments.join("/"));
            if cleaned != "." {
                for segment in cleaned.trim_start_matches('/').split('/') {
                    prop_assert!(!segment.is_empty() || cleaned == "/");
                    prop_assert_ne!(segment, ".");
                }
            }
        }
    }
}
