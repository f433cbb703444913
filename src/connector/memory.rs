use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{Connector, ResumeToken};
use crate::entry::{join_path, FileEntry};
use crate::error::StoreResult;
use crate::walk::{walk, LevelLister};

const KEEP_MARKER: &str = ".keep";

/// In-memory connector for testing and development.
///
/// Stores full paths as keys; directories exist implicitly through deeper
/// keys, or explicitly through a hidden marker object. Every operation
/// succeeds as long as its target exists, which makes this the reference
/// implementation of the connector contract.
pub struct MemoryConnector {
    alias: String,
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryConnector {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create with pre-populated files, keyed by full path.
    pub fn with_files(alias: impl Into<String>, files: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            alias: alias.into(),
            files: RwLock::new(files),
        }
    }

    fn key(path: &str, filename: &str) -> String {
        normalize(&join_path(path, filename))
    }

    fn list_one_level(&self, path: &str) -> Vec<FileEntry> {
        let normalized = normalize(path);
        let prefix = if normalized.is_empty() {
            String::new()
        } else {
            format!("{normalized}/")
        };

        let files = self.files.read();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (key, content) in files.iter() {
            let relative = if prefix.is_empty() {
                key.as_str()
            } else if let Some(stripped) = key.strip_prefix(&prefix) {
                stripped
            } else {
                continue;
            };
            let name = relative.split('/').next().unwrap_or(relative);
            if name.is_empty() || name == KEEP_MARKER {
                continue;
            }
            if seen.insert(name.to_string()) {
                let display_path = format!("/{normalized}");
                if relative.contains('/') {
                    entries.push(FileEntry::directory(display_path, name));
                } else {
                    entries.push(FileEntry::file(display_path, name, content.len() as u64));
                }
            }
        }
        entries
    }
}

struct MemoryLister<'a> {
    store: &'a MemoryConnector,
}

#[async_trait]
impl LevelLister for MemoryLister<'_> {
    async fn list_level(&mut self, path: &str) -> StoreResult<Vec<FileEntry>> {
        Ok(self.store.list_one_level(path))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> &str {
        "memory"
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> bool {
        true
    }

    async fn disconnect(&self) {}

    async fn list(
        &self,
        path: &str,
        deep_find: bool,
        flat_print: bool,
        max_depth: i32,
    ) -> Option<Vec<FileEntry>> {
        let mut lister = MemoryLister { store: self };
        walk(&mut lister, path, deep_find, flat_print, max_depth).await.ok()
    }

    async fn peek_file(&self, path: &str, filename: &str) -> Option<FileEntry> {
        let key = Self::key(path, filename);
        let files = self.files.read();
        let content = files.get(&key)?;
        Some(FileEntry::file(path, filename, content.len() as u64))
    }

    async fn upload(&self, content: &[u8], path: &str, filename: &str) -> bool {
        self.files
            .write()
            .insert(Self::key(path, filename), content.to_vec());
        true
    }

    async fn download(&self, path: &str, filename: &str) -> Option<Bytes> {
        let key = Self::key(path, filename);
        self.files
            .read()
            .get(&key)
            .map(|content| Bytes::from(content.clone()))
    }

    async fn create_directory(&self, path: &str) -> bool {
        let normalized = normalize(path);
        if normalized.is_empty() {
            return false;
        }
        self.files
            .write()
            .insert(format!("{normalized}/{KEEP_MARKER}"), Vec::new());
        true
    }

    async fn delete_file(&self, path: &str, filename: &str) -> bool {
        self.files.write().remove(&Self::key(path, filename)).is_some()
    }

    async fn appender_upload(
        &self,
        chunk: &[u8],
        path: &str,
        filename: &str,
        offset: u64,
    ) -> Option<ResumeToken> {
        let key = Self::key(path, filename);
        let mut files = self.files.write();
        if offset == 0 {
            files.insert(key, chunk.to_vec());
        } else {
            let existing = files.get_mut(&key)?;
            if existing.len() as u64 != offset {
                tracing::warn!(
                    target = "polystore",
                    alias = %self.alias,
                    expected = offset,
                    actual = existing.len(),
                    "append offset does not match stored size"
                );
                return None;
            }
            existing.extend_from_slice(chunk);
        }
        Some(ResumeToken {
            path: path.to_string(),
            filename: filename.to_string(),
        })
    }
}

/// Strip leading and trailing slashes so keys compare consistently.
fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_and_download_round_trip() {
        let store = MemoryConnector::new("mem");
        assert!(store.upload(b"hello world", "/docs", "a.txt").await);
        let content = store.download("/docs", "a.txt").await.unwrap();
        assert_eq!(&content[..], b"hello world");
    }

    #[tokio::test]
    async fn download_missing_file_is_none() {
        let store = MemoryConnector::new("mem");
        assert!(store.download("/docs", "absent.txt").await.is_none());
    }

    #[tokio::test]
    async fn delete_reports_absence() {
        let store = MemoryConnector::new("mem");
        store.upload(b"x", "/d", "f.txt").await;
        assert!(store.delete_file("/d", "f.txt").await);
        assert!(!store.delete_file("/d", "f.txt").await);
        assert!(!store.delete_file("/never", "was.txt").await);
    }

    #[tokio::test]
    async fn shallow_list_shows_files_and_inferred_directories() {
        let store = MemoryConnector::new("mem");
        store.upload(b"1", "/data", "top.txt").await;
        store.upload(b"22", "/data/sub", "inner.txt").await;

        let entries = store.list("/data", false, false, -1).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["sub", "top.txt"]);
        assert!(entries[0].is_directory);
        assert_eq!(entries[1].size, Some(1));
    }

    #[tokio::test]
    async fn deep_nested_list_fills_children() {
        let store = MemoryConnector::new("mem");
        store.upload(b"1", "/data/sub", "inner.txt").await;

        let entries = store.list("/data", true, false, -1).await.unwrap();
        let children = entries[0].children.as_ref().unwrap();
        assert_eq!(children[0].filename, "inner.txt");
    }

    #[tokio::test]
    async fn flat_deep_list_respects_max_depth() {
        let store = MemoryConnector::new("mem");
        store.upload(b"1", "/data/a/b", "deep.txt").await;

        let bounded = store.list("/data", true, true, 1).await.unwrap();
        let names: Vec<&str> = bounded.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let unbounded = store.list("/data", true, true, -1).await.unwrap();
        let names: Vec<&str> = unbounded.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "deep.txt"]);
    }

    #[tokio::test]
    async fn created_directory_is_listed_without_its_marker() {
        let store = MemoryConnector::new("mem");
        assert!(store.create_directory("/data/fresh").await);

        let entries = store.list("/data/fresh", false, false, -1).await.unwrap();
        assert!(entries.is_empty());

        let parent = store.list("/data", false, false, -1).await.unwrap();
        assert_eq!(parent[0].filename, "fresh");
        assert!(parent[0].is_directory);
    }

    #[tokio::test]
    async fn appender_sequence_concatenates_chunks() {
        let store = MemoryConnector::new("mem");
        let token = store.appender_upload(b"abc", "/up", "big.bin", 0).await.unwrap();
        store
            .appender_upload(b"def", &token.path, &token.filename, 3)
            .await
            .unwrap();
        let content = store.download("/up", "big.bin").await.unwrap();
        assert_eq!(&content[..], b"abcdef");
        let entry = store.peek_file("/up", "big.bin").await.unwrap();
        assert_eq!(entry.size, Some(6));
    }

    #[tokio::test]
    async fn appender_rejects_mismatched_offset() {
        let store = MemoryConnector::new("mem");
        store.appender_upload(b"abc", "/up", "big.bin", 0).await.unwrap();
        assert!(store.appender_upload(b"def", "/up", "big.bin", 7).await.is_none());
        let content = store.download("/up", "big.bin").await.unwrap();
        assert_eq!(&content[..], b"abc");
    }

    #[tokio::test]
    async fn base64_helpers_round_trip_through_defaults() {
        let store = MemoryConnector::new("mem");
        assert!(store.upload_base64("aGVsbG8=", "/b64", "msg.txt").await);
        let encoded = store.download_base64("/b64", "msg.txt").await.unwrap();
        assert_eq!(encoded, "aGVsbG8=");
        assert!(!store.upload_base64("%%not base64%%", "/b64", "bad.txt").await);
    }

    #[tokio::test]
    async fn peek_reports_size_without_content() {
        let store = MemoryConnector::new("mem");
        store.upload(b"12345", "/d", "f.txt").await;
        let entry = store.peek_file("/d", "f.txt").await.unwrap();
        assert_eq!(entry.size, Some(5));
        assert!(entry.is_file);
        assert!(store.peek_file("/d", "missing").await.is_none());
    }
}
