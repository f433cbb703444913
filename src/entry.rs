//! File/directory metadata returned by listing and lookup operations.

use std::collections::BTreeMap;

use serde::Serialize;

/// Opaque backend-native attributes (version id, mtime, crc32, ...).
/// Carried through unmodified; the core never interprets these.
pub type NativeRecord = BTreeMap<String, String>;

/// One file or directory entry.
///
/// `size` is `None` when the backend doesn't report one; unknown is a
/// valid state, not zero. Object-store pseudo-directories may report both
/// `is_file` and `is_directory` as false. `children` is populated only in
/// nested (non-flattened) deep listings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileEntry {
    pub absolute_path: String,
    pub filename: String,
    pub size: Option<u64>,
    pub is_file: bool,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<NativeRecord>,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        Self {
            absolute_path: path.into(),
            filename: filename.into(),
            size: Some(size),
            is_file: true,
            is_directory: false,
            children: None,
            native: None,
        }
    }

    pub fn directory(path: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            absolute_path: path.into(),
            filename: filename.into(),
            size: None,
            is_file: false,
            is_directory: true,
            children: None,
            native: None,
        }
    }

    pub fn with_native(mut self, native: NativeRecord) -> Self {
        self.native = Some(native);
        self
    }

    /// Full remote path of this entry (`absolute_path` joined with
    /// `filename`, avoiding doubled slashes).
    pub fn full_path(&self) -> String {
        join_path(&self.absolute_path, &self.filename)
    }
}

/// Join a directory path and a leaf name without doubling slashes.
pub(crate) fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        return name.to_string();
    }
    if path.ends_with('/') {
        format!("{path}{name}")
    } else {
        format!("{path}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_root_and_trailing_slash() {
        assert_eq!(join_path("/", "a.txt"), "/a.txt");
        assert_eq!(join_path("/data", "a.txt"), "/data/a.txt");
        assert_eq!(join_path("/data/", "a.txt"), "/data/a.txt");
        assert_eq!(join_path("", "a.txt"), "a.txt");
    }

    #[test]
    fn unknown_size_is_none_not_zero() {
        let dir = FileEntry::directory("/data", "sub");
        assert_eq!(dir.size, None);
        assert!(dir.is_directory);
        assert!(!dir.is_file);
    }
}
