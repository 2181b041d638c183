//! POSIX-style node path helpers

use crate::error::{Error, Result};

/// Validate a node path: absolute, no empty segments, no trailing slash
pub fn validate(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!("{} is not absolute", path)));
    }
    if path.ends_with('/') {
        return Err(Error::InvalidPath(format!("{} has a trailing slash", path)));
    }
    if path[1..].split('/').any(|s| s.is_empty() || s == "." || s == "..") {
        return Err(Error::InvalidPath(format!("{} has an empty or relative segment", path)));
    }
    if path.contains('\0') {
        return Err(Error::InvalidPath("path contains a NUL byte".into()));
    }
    Ok(())
}

/// Join a base path and a relative child path
pub fn join(base: &str, child: &str) -> String {
    if base == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", base, child)
    }
}

/// Parent of a path (`None` for the root)
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Every non-root prefix of a path, shortest first, ending with the path itself
pub fn ancestors(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}
