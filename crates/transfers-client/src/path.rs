//! Path normalisation relative to a system root

use transfers_types::{Error, Result};

/// Normalise a user supplied path into a root-relative path without a leading
/// slash. `.` segments are dropped and `..` is resolved; a `..` that would leave
/// the root is rejected instead of clamped.
pub fn normalize(path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::PathTraversal {
                        path: path.to_string(),
                    });
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// Absolute location of `path` beneath `root`
pub fn resolve(root: &str, path: &str) -> Result<String> {
    let relative = normalize(path)?;
    let root = root.trim_end_matches('/');
    if relative.is_empty() {
        return Ok(if root.is_empty() { "/".to_string() } else { root.to_string() });
    }
    Ok(format!("{root}/{relative}"))
}

/// Turn an absolute backend path back into a root-relative one
pub fn relativize(root: &str, absolute: &str) -> String {
    let root = root.trim_end_matches('/');
    absolute
        .strip_prefix(root)
        .unwrap_or(absolute)
        .trim_matches('/')
        .to_string()
}

/// Parent of a root-relative path, empty for top level entries
pub fn parent(relative: &str) -> &str {
    relative.rsplit_once('/').map_or("", |(parent, _)| parent)
}

/// Last segment of a path
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

/// Join two root-relative paths
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_matches('/');
    let name = name.trim_matches('/');
    match (base.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{name}"),
    }
}

/// Access URL advertised in [`transfers_types::FileInfo::url`]
pub fn file_url(tenant: &str, system_id: &str, relative: &str) -> String {
    format!("tapis://{tenant}/{system_id}/{}", relative.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("/dir/a.txt", "dir/a.txt")]
    #[case("dir//./b/../a.txt", "dir/a.txt")]
    #[case("/", "")]
    #[case("a/..", "")]
    fn test_normalize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input).unwrap(), expected);
    }

    #[rstest]
    #[case("..")]
    #[case("/../etc/passwd")]
    #[case("dir/../../x")]
    fn test_normalize_rejects_traversal(#[case] input: &str) {
        assert!(matches!(normalize(input), Err(Error::PathTraversal { .. })));
    }

    #[test]
    fn test_resolve_and_relativize() {
        assert_eq!(resolve("/home/alice/", "/data/x").unwrap(), "/home/alice/data/x");
        assert_eq!(resolve("/home/alice", "").unwrap(), "/home/alice");
        assert_eq!(resolve("/", "a").unwrap(), "/a");
        assert_eq!(resolve("/", "/").unwrap(), "/");
        assert_eq!(relativize("/home/alice", "/home/alice/data/x"), "data/x");
        assert_eq!(relativize("/", "/a/b"), "a/b");
    }

    #[test]
    fn test_helpers() {
        assert_eq!(parent("a/b/c"), "a/b");
        assert_eq!(parent("c"), "");
        assert_eq!(file_name("a/b/c/"), "c");
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("a/", "/x"), "a/x");
        assert_eq!(file_url("t1", "sysA", "/a/b"), "tapis://t1/sysA/a/b");
    }

    proptest! {
        #[test]
        fn test_resolved_paths_stay_under_root(segments in prop::collection::vec("[a-z]{1,3}|\\.\\.|\\.", 0..8)) {
            let path = segments.join("/");
            if let Ok(resolved) = resolve("/srv/root", &path) {
                prop_assert!(resolved.starts_with("/srv/root"));
                prop_assert!(!resolved.split('/').any(|s| s == ".."));
            }
        }
    }
}
