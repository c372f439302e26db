//! Pure path arithmetic over normalized virtual paths.
//!
//! Every key in the tree map is a normalized path: a single leading `/`, no
//! trailing `/` (except the root itself), no empty segments, no `.` or `..`
//! steps. Path comparison everywhere else in the crate is plain byte equality
//! over this form.

/// Normalizes `path` by collapsing separator runs and resolving `.` and `..`
/// segments against the virtual root.
///
/// `..` at the root stays at the root; there is nothing above `/`.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }

    if parts.is_empty() {
        "/".to_owned()
    } else {
        let mut out = String::with_capacity(path.len());
        for seg in parts {
            out.push('/');
            out.push_str(seg);
        }
        out
    }
}

/// Returns the normalized parent of `path`.
///
/// The root is its own parent; this sentinel is what stops recursive
/// directory walks from running off the top of the tree.
pub fn parent(path: &str) -> String {
    let p = normalize(path);
    match p.rfind('/') {
        Some(0) => "/".to_owned(),
        Some(idx) => p[..idx].to_owned(),
        None => "/".to_owned(),
    }
}

/// Returns the final segment of `path`, or `"/"` for the root.
pub fn basename(path: &str) -> String {
    let p = normalize(path);
    if p == "/" {
        return p;
    }
    p.rsplit('/').next().unwrap_or("/").to_owned()
}

/// Joins `rel` onto `base` and normalizes the result.
///
/// An absolute `rel` replaces `base` entirely, mirroring shell resolution.
pub fn join(base: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        normalize(rel)
    } else {
        normalize(&format!("{}/{}", base, rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_runs_and_trailing_separators() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/a//b/c/"), "/a/b/c");
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("///"), "/");
    }

    #[test]
    fn normalize_resolves_dot_segments() {
        assert_eq!(normalize("/a/./b"), "/a/b");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("/../a"), "/a");
        assert_eq!(normalize("/a/.."), "/");
    }

    #[test]
    fn parent_of_root_is_root() {
        assert_eq!(parent("/"), "/");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(parent("/a//b/"), "/a");
    }

    #[test]
    fn basename_returns_final_segment() {
        assert_eq!(basename("/"), "/");
        assert_eq!(basename("/a"), "a");
        assert_eq!(basename("/a/b/c/"), "c");
    }

    #[test]
    fn join_resolves_relative_and_absolute() {
        assert_eq!(join("/a/b", "c"), "/a/b/c");
        assert_eq!(join("/a/b", "../c"), "/a/c");
        assert_eq!(join("/a/b", "/c"), "/c");
        assert_eq!(join("/", "x/y"), "/x/y");
    }
}
