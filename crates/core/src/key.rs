//! Key normalization
//!
//! Backends root caller keys under their prefix with [`join_key`] exactly
//! once, and strip it again with [`strip_key_prefix`] when listing.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Join a prefix and a key with a single `/`
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{key}"),
    }
}

/// Listing prefix that only matches keys inside the `dir` "directory"
pub fn dir_prefix(dir: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    }
}

/// Strip a bucket prefix from a stored key
///
/// Keys that do not live under `prefix` are returned unchanged.
pub fn strip_key_prefix(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return key.to_string();
    }
    match key.strip_prefix(prefix) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            rest.trim_start_matches('/').to_string()
        }
        _ => key.to_string(),
    }
}

/// Path of `key` relative to the `base` directory key
pub fn relative_key(base: &str, key: &str) -> Result<String> {
    let base = base.trim_matches('/');
    if base.is_empty() {
        return Ok(key.trim_start_matches('/').to_string());
    }
    match key.strip_prefix(base) {
        Some(rest) if rest.starts_with('/') => Ok(rest.trim_start_matches('/').to_string()),
        _ => Err(Error::InvalidKey(format!(
            "'{key}' is not inside '{base}'"
        ))),
    }
}

/// Convert a relative filesystem path into a `/`-separated key
pub fn path_to_key(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| {
                        Error::InvalidKey(format!("non UTF-8 path '{}'", path.display()))
                    })?
                    .to_string(),
            ),
            Component::CurDir => {}
            _ => {
                return Err(Error::InvalidKey(format!(
                    "'{}' is not a relative path",
                    path.display()
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

/// Convert a key into a relative filesystem path, rejecting keys that would
/// escape the directory they are joined onto
pub fn key_to_path(key: &str) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for part in key.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if part == ".." {
            return Err(Error::InvalidKey(format!("'{key}' escapes its root")));
        }
        path.push(part);
    }
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidKey(format!("'{key}' names no file")));
    }
    Ok(path)
}
