//! Key path normalization
//!
//! Every backend stores keys in the form `/path/to/key`. Callers may pass
//! `path/to/key`, `/path/to/key/` or `//path//to/key` and must land on the
//! same physical key.

/// Separator between key segments
pub const SEPARATOR: char = '/';

/// Split `key` into its non-empty segments.
pub fn split_key(key: &str) -> Vec<&str> {
    key.split(SEPARATOR).filter(|s| !s.is_empty()).collect()
}

/// Normalize the key to the form `/path/to/key`.
///
/// The empty key and `/` both normalize to `/`.
pub fn normalize(key: &str) -> String {
    let parts = split_key(key);
    let mut out = String::with_capacity(key.len() + 1);
    if parts.is_empty() {
        out.push(SEPARATOR);
        return out;
    }
    for part in parts {
        out.push(SEPARATOR);
        out.push_str(part);
    }
    out
}

/// Normalized parent directory of `key`, `/` for top-level keys.
pub fn directory(key: &str) -> String {
    let parts = split_key(key);
    match parts.split_last() {
        Some((_, parents)) if !parents.is_empty() => normalize(&parents.join("/")),
        _ => SEPARATOR.to_string(),
    }
}

/// Last segment of `key`, empty for the root.
pub fn base_name(key: &str) -> &str {
    split_key(key).last().copied().unwrap_or("")
}

/// Join a normalized directory and a child name.
pub fn join(dir: &str, child: &str) -> String {
    normalize(&format!("{}{}{}", dir, SEPARATOR, child))
}

/// Whether normalized `key` is `dir` itself or lies below it.
pub fn is_within(key: &str, dir: &str) -> bool {
    dir == "/"
        || key
            .strip_prefix(dir)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(SEPARATOR))
}

/// Byte prefix shared by every key strictly below normalized `dir`.
pub fn tree_prefix(dir: &str) -> String {
    if dir.ends_with(SEPARATOR) {
        dir.to_string()
    } else {
        format!("{}{}", dir, SEPARATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("foo"), "/foo");
        assert_eq!(normalize("/foo"), "/foo");
        assert_eq!(normalize("foo/"), "/foo");
        assert_eq!(normalize("//foo//bar///"), "/foo/bar");
        assert_eq!(normalize("foo/bar/baz"), "/foo/bar/baz");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("///"), "/");
    }

    #[test]
    fn test_directory() {
        assert_eq!(directory("/foo/bar/baz"), "/foo/bar");
        assert_eq!(directory("foo/bar"), "/foo");
        assert_eq!(directory("/foo"), "/");
        assert_eq!(directory("/"), "/");
    }

    #[test]
    fn test_base_name_and_join() {
        assert_eq!(base_name("/foo/bar"), "bar");
        assert_eq!(base_name("/"), "");
        assert_eq!(join("/foo", "bar"), "/foo/bar");
        assert_eq!(join("/", "bar"), "/bar");
    }

    #[test]
    fn test_tree_scope_excludes_siblings() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/x", "/"));
        assert_eq!(tree_prefix("/a"), "/a/");
        assert_eq!(tree_prefix("/"), "/");
        assert!(!"/ab".starts_with(&tree_prefix("/a")));
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(key in "[a-z/]{0,32}") {
            let once = normalize(&key);
            prop_assert_eq!(normalize(&once), once.clone());
        }

        #[test]
        fn prop_leading_separator_does_not_alias(key in "[a-z]{1,8}(/[a-z]{1,8}){0,4}") {
            prop_assert_eq!(normalize(&key), normalize(&format!("/{}", key)));
            prop_assert_eq!(normalize(&key), normalize(&format!("{}/", key)));
        }

        #[test]
        fn prop_normalized_shape(key in "[a-z/]{0,32}") {
            let n = normalize(&key);
            prop_assert!(n.starts_with('/'));
            prop_assert!(!n.contains("//"));
            prop_assert!(n == "/" || !n.ends_with('/'));
        }
    }
}
