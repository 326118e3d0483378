//! Small shared helpers

use rand::Rng;

/// Milliseconds since the Unix epoch, the timestamp unit used in the
/// provider schema and the API.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize a virtual path: force a leading slash, collapse `.` and
/// empty segments, resolve `..` lexically without ever escaping the root,
/// and drop any trailing slash.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// The parent of a cleaned virtual path ("/" is its own parent).
pub fn parent_path(path: &str) -> String {
    let cleaned = clean_path(path);
    match cleaned.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => cleaned[..idx].to_string(),
    }
}

/// The final component of a cleaned virtual path.
pub fn base_name(path: &str) -> String {
    let cleaned = clean_path(path);
    cleaned.rsplit('/').next().unwrap_or("").to_string()
}

/// Join a relative name onto a cleaned virtual directory path.
pub fn join_path(dir: &str, name: &str) -> String {
    clean_path(&format!("{}/{}", dir, name))
}

/// True when `ancestor` is `path` or a path prefix of it on a
/// component boundary. Both inputs must already be cleaned.
pub fn is_same_or_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" || ancestor == path {
        return true;
    }
    path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/')
}

const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random alphanumeric string, used for share ids, API keys and codes.
pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ALNUM.len());
            ALNUM[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_cases() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("a/b"), "/a/b");
        assert_eq!(clean_path("/a//b/./c/"), "/a/b/c");
        assert_eq!(clean_path("/a/../../b"), "/b");
        assert_eq!(clean_path("/.."), "/");
    }

    #[test]
    fn parent_and_base() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "/");
        assert_eq!(base_name("/a/b/c.txt"), "c.txt");
    }

    #[test]
    fn ancestor_checks_component_boundaries() {
        assert!(is_same_or_ancestor("/", "/anything"));
        assert!(is_same_or_ancestor("/a/b", "/a/b/c"));
        assert!(is_same_or_ancestor("/a/b", "/a/b"));
        assert!(!is_same_or_ancestor("/a/b", "/a/bc"));
        assert!(!is_same_or_ancestor("/a/b", "/a"));
    }

    #[test]
    fn random_string_shape() {
        let s = random_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.bytes().all(|b| b.is_ascii_alphanumeric()));
    }
}
