//! Shared lexical path helpers used by the storage backends.
//!
//! All user-visible paths are absolute, `/`-separated and backend-agnostic;
//! these helpers never touch the filesystem.

/// Clean a virtual path to its canonical absolute form.
///
/// Collapses repeated separators, resolves `.` and `..` segments (never
/// above the root) and guarantees a leading `/`. The empty string and `.`
/// clean to `/`.
pub(crate) fn clean(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

/// Last path segment, `/` for the root.
pub(crate) fn base(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Parent of the cleaned path, `/` when there is none.
pub(crate) fn dir(path: &str) -> String {
    let cleaned = clean(path);
    match cleaned.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => cleaned[..idx].to_string(),
    }
}

/// Join path elements into one cleaned absolute path.
pub(crate) fn join(elems: &[&str]) -> String {
    clean(&elems.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean(""), "/");
        assert_eq!(clean("."), "/");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("/foo"), "/foo");
        assert_eq!(clean("foo"), "/foo");
        assert_eq!(clean("/foo/"), "/foo");
        assert_eq!(clean("/foo//bar"), "/foo/bar");
        assert_eq!(clean("/foo/./bar"), "/foo/bar");
        assert_eq!(clean("/foo/../bar"), "/bar");
        assert_eq!(clean("/../.."), "/");
        assert_eq!(clean("a/b/../../.."), "/");
    }

    #[test]
    fn test_base() {
        assert_eq!(base("/"), "/");
        assert_eq!(base(""), "/");
        assert_eq!(base("/foo"), "foo");
        assert_eq!(base("/foo/bar"), "bar");
        assert_eq!(base("/foo/bar/"), "bar");
        assert_eq!(base("bar"), "bar");
    }

    #[test]
    fn test_dir() {
        assert_eq!(dir("/"), "/");
        assert_eq!(dir("/foo"), "/");
        assert_eq!(dir("/foo/bar"), "/foo");
        assert_eq!(dir("/foo/bar/"), "/foo");
    }

    #[test]
    fn test_join() {
        assert_eq!(join(&["/a", "b"]), "/a/b");
        assert_eq!(join(&["a", "", "b/"]), "/a/b");
        assert_eq!(join(&["/", ".."]), "/");
    }
}
