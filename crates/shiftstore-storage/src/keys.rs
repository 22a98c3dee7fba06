//! Shared key handling for bucket backends.
//!
//! Keys are slash-delimited, relative, and never contain `..` or empty
//! segments. Prefixes follow the same rules but may be empty and may end in `/`.

use crate::traits::{StorageError, StorageResult};

/// Suffix of the hidden files the local backend writes before renaming.
pub(crate) const PARTIAL_SUFFIX: &str = ".partial";

/// Validate an object key.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key is empty".to_string()));
    }
    if key.ends_with('/') {
        return Err(StorageError::InvalidKey(format!(
            "key {:?} ends with a separator",
            key
        )));
    }
    validate_segments(key)?;

    if let Some(name) = key.rsplit('/').next() {
        if is_partial_name(name) {
            return Err(StorageError::InvalidKey(format!(
                "key {:?} uses a reserved file name",
                key
            )));
        }
    }
    Ok(())
}

/// Validate a listing prefix. The empty prefix selects everything.
pub fn validate_prefix(prefix: &str) -> StorageResult<()> {
    if prefix.is_empty() {
        return Ok(());
    }
    validate_segments(prefix.strip_suffix('/').unwrap_or(prefix))
}

fn validate_segments(value: &str) -> StorageResult<()> {
    if value.starts_with('/') || value.contains('\\') {
        return Err(StorageError::InvalidKey(format!(
            "{:?} must be a relative slash-delimited path",
            value
        )));
    }
    for segment in value.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(StorageError::InvalidKey(format!(
                "{:?} contains an empty or relative segment",
                value
            )));
        }
    }
    Ok(())
}

/// The directory portion of a prefix: everything before the last `/`.
///
/// `"data/avatars/ab"` -> `"data/avatars"`, `"data/"` -> `"data"`, `"1"` -> `""`.
pub fn prefix_dir(prefix: &str) -> &str {
    match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    }
}

/// Whether a directory key could hold objects matching `prefix`.
pub(crate) fn dir_may_match(dir_key: &str, prefix: &str) -> bool {
    let dir = format!("{}/", dir_key);
    dir.starts_with(prefix) || prefix.starts_with(&dir)
}

pub(crate) fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_keys() {
        assert!(validate_key("a").is_ok());
        assert!(validate_key("data/avatars/1f/ab.png").is_ok());
        assert!(validate_key(".hidden").is_ok());
    }

    #[test]
    fn rejects_bad_keys() {
        for key in [
            "",
            "/etc/passwd",
            "../secret",
            "a/../b",
            "a//b",
            "a/",
            "./a",
            "a\\b",
            "dir/.x.0a1b.partial",
        ] {
            assert!(
                matches!(validate_key(key), Err(StorageError::InvalidKey(_))),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn prefixes_allow_empty_and_trailing_slash() {
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("data/").is_ok());
        assert!(validate_prefix("1").is_ok());
        assert!(validate_prefix("/data").is_err());
        assert!(validate_prefix("data/../x").is_err());
    }

    #[test]
    fn prefix_dir_splits_on_last_separator() {
        assert_eq!(prefix_dir(""), "");
        assert_eq!(prefix_dir("1"), "");
        assert_eq!(prefix_dir("data/"), "data");
        assert_eq!(prefix_dir("data/avatars/ab"), "data/avatars");
    }

    #[test]
    fn dir_matching() {
        assert!(dir_may_match("1", "1"));
        assert!(dir_may_match("10", "1"));
        assert!(!dir_may_match("2", "1"));
        assert!(dir_may_match("data", "data/avatars"));
        assert!(!dir_may_match("datastore", "data/avatars"));
        assert!(dir_may_match("anything", ""));
    }
}
