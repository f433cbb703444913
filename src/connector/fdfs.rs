use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{Connector, ResumeToken};
use crate::entry::{FileEntry, NativeRecord};
use crate::error::StoreResult;
use crate::fdfs::proto::EXT_NAME_LEN;
use crate::fdfs::{FdfsTimeouts, StorageClient, StorageNode, TrackerClient};
use crate::profile::ConnectionProfile;

/// Normalized FastDFS address: storage group plus the flat key under it.
/// There is no directory tree; the key's final segment doubles as the
/// leaf name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FdfsLocation {
    pub group: String,
    pub key: String,
}

impl FdfsLocation {
    pub fn leaf(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Merge whichever of `path`/`filename` carries the address, strip
/// surrounding slashes, and split the first segment off as the group.
/// All four legal input shapes (full string in either argument, or any
/// split between them) normalize to the same location.
pub(crate) fn resolve(path: &str, filename: &str) -> Option<FdfsLocation> {
    let combined = format!("{}/{}", path.trim(), filename.trim());
    let mut segments = combined.split('/').filter(|s| !s.is_empty());
    let group = segments.next()?.to_string();
    let key: Vec<&str> = segments.collect();
    if key.is_empty() {
        return None;
    }
    Some(FdfsLocation {
        group,
        key: key.join("/"),
    })
}

/// Extension for the storage server's fixed six-byte ext field.
fn ext_name(filename: &str) -> String {
    let ext = filename.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    ext.chars().take(EXT_NAME_LEN).collect()
}

/// Group hint for uploads: the first segment of `path` when one is given,
/// otherwise the tracker picks a group.
fn group_hint(path: &str) -> Option<String> {
    path.split('/')
        .find(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
}

/// Connector for a FastDFS-style distributed object store.
///
/// Addressing is group + flat key; the tracker cluster brokers every
/// operation to a storage server and each round-trip uses its own
/// connection, so there is no session to guard or retry.
pub struct FdfsConnector {
    alias: String,
    tracker: TrackerClient,
    storage: StorageClient,
}

impl FdfsConnector {
    pub fn new(profile: ConnectionProfile) -> StoreResult<Self> {
        let profile = profile.validate()?;
        let trackers = profile
            .options
            .get_str_list("trackerList")
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| vec![profile.endpoint()]);
        let timeouts = FdfsTimeouts {
            connect: Duration::from_millis(
                profile.options.get_i64("connectTimeout").unwrap_or(600) as u64,
            ),
            socket: Duration::from_millis(
                profile.options.get_i64("soTimeout").unwrap_or(1500) as u64,
            ),
        };
        Ok(Self {
            alias: profile.alias.clone(),
            tracker: TrackerClient::new(trackers, timeouts),
            storage: StorageClient::new(timeouts),
        })
    }

    async fn fetch_node(&self, loc: &FdfsLocation) -> Option<StorageNode> {
        match self.tracker.query_fetch(&loc.group, &loc.key).await {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, group = %loc.group, %err, "tracker fetch query failed");
                None
            }
        }
    }

    async fn update_node(&self, loc: &FdfsLocation) -> Option<StorageNode> {
        match self.tracker.query_update(&loc.group, &loc.key).await {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, group = %loc.group, %err, "tracker update query failed");
                None
            }
        }
    }

    fn size_metadata(filename: &str, size: u64) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        meta.insert("ext_name".to_string(), ext_name(filename));
        meta.insert("file_size".to_string(), size.to_string());
        meta
    }
}

#[async_trait]
impl Connector for FdfsConnector {
    fn kind(&self) -> &str {
        "fdfs"
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> bool {
        match self.tracker.list_groups().await {
            Ok(groups) => {
                tracing::info!(target = "polystore", alias = %self.alias, groups = groups.len(), "tracker cluster reachable");
                true
            }
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, %err, "tracker cluster unreachable");
                false
            }
        }
    }

    async fn disconnect(&self) {}

    /// The store has no directory tree; the only listable level is the
    /// group roster, exposed for the empty path. The depth flags have
    /// nothing to act on in a flat namespace.
    async fn list(
        &self,
        path: &str,
        _deep_find: bool,
        _flat_print: bool,
        _max_depth: i32,
    ) -> Option<Vec<FileEntry>> {
        if !path.trim_matches('/').trim().is_empty() {
            tracing::debug!(target = "polystore", alias = %self.alias, path, "store has no directory hierarchy to list");
            return None;
        }
        match self.tracker.list_groups().await {
            Ok(groups) => Some(
                groups
                    .into_iter()
                    .map(|g| {
                        let mut native = NativeRecord::new();
                        native.insert("total_mb".to_string(), g.total_mb.to_string());
                        native.insert("free_mb".to_string(), g.free_mb.to_string());
                        native.insert("server_count".to_string(), g.server_count.to_string());
                        native.insert("active_count".to_string(), g.active_count.to_string());
                        FileEntry::directory("/", g.name.clone()).with_native(native)
                    })
                    .collect(),
            ),
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, %err, "group listing failed");
                None
            }
        }
    }

    async fn peek_file(&self, path: &str, filename: &str) -> Option<FileEntry> {
        let loc = resolve(path, filename)?;
        let node = self.fetch_node(&loc).await?;
        match self.storage.query_file_info(&node, &loc.group, &loc.key).await {
            Ok(Some(info)) => {
                let mut native = NativeRecord::new();
                native.insert("crc32".to_string(), info.crc32.to_string());
                native.insert("create_time".to_string(), info.create_time.to_string());
                native.insert("group".to_string(), loc.group.clone());
                Some(
                    FileEntry::file(format!("/{}", loc.group), loc.key.clone(), info.size)
                        .with_native(native),
                )
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, group = %loc.group, %err, "file info query failed");
                None
            }
        }
    }

    async fn upload(&self, content: &[u8], path: &str, filename: &str) -> bool {
        let group = group_hint(path);
        let node = match self.tracker.query_store(group.as_deref()).await {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, %err, "no storage server for upload");
                return false;
            }
        };
        match self.storage.upload(&node, &ext_name(filename), content, false).await {
            Ok(stored) => {
                tracing::info!(
                    target = "polystore",
                    alias = %self.alias,
                    group = %stored.group,
                    remote = %stored.filename,
                    bytes = content.len(),
                    "upload stored"
                );
                true
            }
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, %err, "upload failed");
                false
            }
        }
    }

    async fn download(&self, path: &str, filename: &str) -> Option<Bytes> {
        let loc = resolve(path, filename)?;
        let node = self.fetch_node(&loc).await?;
        match self.storage.download(&node, &loc.group, &loc.key).await {
            Ok(Some(content)) => Some(Bytes::from(content)),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, group = %loc.group, %err, "download failed");
                None
            }
        }
    }

    async fn create_directory(&self, path: &str) -> bool {
        tracing::debug!(target = "polystore", alias = %self.alias, path, "store has no directories to create");
        false
    }

    async fn delete_file(&self, path: &str, filename: &str) -> bool {
        let Some(loc) = resolve(path, filename) else {
            return false;
        };
        let Some(node) = self.update_node(&loc).await else {
            return false;
        };
        match self.storage.delete(&node, &loc.group, &loc.key).await {
            Ok(existed) => existed,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, group = %loc.group, %err, "delete failed");
                false
            }
        }
    }

    async fn appender_upload(
        &self,
        chunk: &[u8],
        path: &str,
        filename: &str,
        offset: u64,
    ) -> Option<ResumeToken> {
        if offset == 0 {
            let group = group_hint(path);
            let node = match self.tracker.query_store(group.as_deref()).await {
                Ok(node) => node,
                Err(err) => {
                    tracing::warn!(target = "polystore", alias = %self.alias, %err, "no storage server for append upload");
                    return None;
                }
            };
            let stored = match self.storage.upload(&node, &ext_name(filename), chunk, true).await {
                Ok(stored) => stored,
                Err(err) => {
                    tracing::warn!(target = "polystore", alias = %self.alias, %err, "appender upload failed");
                    return None;
                }
            };
            let meta = Self::size_metadata(filename, chunk.len() as u64);
            if let Err(err) = self
                .storage
                .set_metadata(&node, &stored.group, &stored.filename, &meta, false)
                .await
            {
                tracing::warn!(target = "polystore", alias = %self.alias, %err, "initial size metadata write failed");
                return None;
            }
            return Some(ResumeToken {
                path: stored.group,
                filename: stored.filename,
            });
        }

        let loc = resolve(path, filename)?;
        let node = self.update_node(&loc).await?;
        let info = match self.storage.query_file_info(&node, &loc.group, &loc.key).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                tracing::warn!(target = "polystore", alias = %self.alias, group = %loc.group, "append target missing");
                return None;
            }
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, group = %loc.group, %err, "size probe before append failed");
                return None;
            }
        };
        if info.size != offset {
            tracing::warn!(
                target = "polystore",
                alias = %self.alias,
                expected = offset,
                actual = info.size,
                "append offset does not match stored size"
            );
            return None;
        }
        // The size probe above pinned the offset to the end of the file.
        if let Err(err) = self.storage.append(&node, &loc.key, chunk).await {
            tracing::warn!(target = "polystore", alias = %self.alias, group = %loc.group, %err, "append failed");
            return None;
        }
        // Size metadata is reconciled read-then-write; concurrent appends
        // to the same object are the caller's problem.
        let meta = Self::size_metadata(loc.leaf(), offset + chunk.len() as u64);
        if let Err(err) = self
            .storage
            .set_metadata(&node, &loc.group, &loc.key, &meta, true)
            .await
        {
            tracing::warn!(target = "polystore", alias = %self.alias, %err, "size metadata merge failed");
        }
        Some(ResumeToken {
            path: loc.group,
            filename: loc.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn resolution_shapes_are_equivalent() {
        let expected = FdfsLocation {
            group: "bucket".to_string(),
            key: "a/b/file.txt".to_string(),
        };
        assert_eq!(resolve("bucket/a/b", "file.txt").unwrap(), expected);
        assert_eq!(resolve("bucket", "a/b/file.txt").unwrap(), expected);
        assert_eq!(resolve("", "bucket/a/b/file.txt").unwrap(), expected);
        assert_eq!(resolve("bucket/a/b/file.txt", "").unwrap(), expected);
    }

    #[test]
    fn leading_slash_and_doubled_slashes_are_tolerated() {
        let loc = resolve("/group1//M00/00", "pic.png").unwrap();
        assert_eq!(loc.group, "group1");
        assert_eq!(loc.key, "M00/00/pic.png");
        assert_eq!(loc.leaf(), "pic.png");
    }

    #[test]
    fn group_alone_is_not_a_file_address() {
        assert!(resolve("group1", "").is_none());
        assert!(resolve("", "").is_none());
    }

    #[test]
    fn ext_name_is_clamped_to_six_chars() {
        assert_eq!(ext_name("a.png"), "png");
        assert_eq!(ext_name("archive.tar.gz"), "gz");
        assert_eq!(ext_name("noext"), "");
        assert_eq!(ext_name("f.verylongext"), "verylo");
    }

    #[test]
    fn group_hint_takes_first_segment() {
        assert_eq!(group_hint("/group1/sub"), Some("group1".to_string()));
        assert_eq!(group_hint(""), None);
        assert_eq!(group_hint("//"), None);
    }

    proptest! {
        /// Any split point of a combined address yields the same location.
        #[test]
        fn any_split_of_the_address_resolves_identically(
            group in "[a-z][a-z0-9]{0,6}",
            segments in prop::collection::vec("[a-z0-9]{1,8}", 1..5),
            split in 0usize..5,
        ) {
            let full = format!("{group}/{}", segments.join("/"));
            let parts: Vec<&str> = full.split('/').collect();
            let split = split.min(parts.len());
            let path = parts[..split].join("/");
            let filename = parts[split..].join("/");
            let combined = resolve(&full, "");
            let split_form = resolve(&path, &filename);
            prop_assert_eq!(combined, split_form);
        }
    }
}
