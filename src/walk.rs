//! Shared recursive directory traversal for hierarchical backends.
//!
//! FTP and SFTP can only list one level at a time, so deep listings are a
//! client-side walk. A connector exposes one level through [`LevelLister`]
//! and [`walk`] handles recursion, depth bounds, and the nested/flattened
//! result shapes.
//!
//! Error handling during a walk is asymmetric: a transient failure aborts
//! the whole traversal so the caller's retry logic reruns it against a
//! fresh session, while a protocol failure inside one subdirectory only
//! prunes that branch.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::entry::FileEntry;
use crate::error::StoreResult;

/// One level of a remote directory tree.
#[async_trait]
pub(crate) trait LevelLister: Send {
    async fn list_level(&mut self, path: &str) -> StoreResult<Vec<FileEntry>>;
}

/// Walk `path`, honoring the listing flags.
///
/// `max_depth < 0` means unlimited; otherwise children are descended into
/// only while their depth stays within the bound (direct children sit at
/// depth one).
pub(crate) async fn walk<L: LevelLister>(
    lister: &mut L,
    path: &str,
    deep_find: bool,
    flat_print: bool,
    max_depth: i32,
) -> StoreResult<Vec<FileEntry>> {
    if !deep_find {
        return lister.list_level(path).await;
    }
    if flat_print {
        walk_flat(lister, path.to_string(), 0, max_depth).await
    } else {
        walk_nested(lister, path.to_string(), 0, max_depth).await
    }
}

fn within_bound(next_depth: i32, max_depth: i32) -> bool {
    max_depth < 0 || next_depth <= max_depth
}

fn walk_nested<'a, L: LevelLister>(
    lister: &'a mut L,
    path: String,
    depth: i32,
    max_depth: i32,
) -> BoxFuture<'a, StoreResult<Vec<FileEntry>>> {
    Box::pin(async move {
        let mut entries = lister.list_level(&path).await?;
        if !within_bound(depth + 1, max_depth) {
            return Ok(entries);
        }
        for entry in entries.iter_mut() {
            if !entry.is_directory {
                continue;
            }
            let child_path = entry.full_path();
            match walk_nested(&mut *lister, child_path, depth + 1, max_depth).await {
                Ok(children) => entry.children = Some(children),
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    tracing::warn!(target = "polystore", path = %entry.full_path(), %err, "skipping unreadable subdirectory");
                }
            }
        }
        Ok(entries)
    })
}

fn walk_flat<'a, L: LevelLister>(
    lister: &'a mut L,
    path: String,
    depth: i32,
    max_depth: i32,
) -> BoxFuture<'a, StoreResult<Vec<FileEntry>>> {
    Box::pin(async move {
        let entries = lister.list_level(&path).await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let descend = entry.is_directory && within_bound(depth + 1, max_depth);
            let child_path = entry.full_path();
            out.push(entry);
            if descend {
                match walk_flat(&mut *lister, child_path.clone(), depth + 1, max_depth).await {
                    Ok(descendants) => out.extend(descendants),
                    Err(err) if err.is_transient() => return Err(err),
                    Err(err) => {
                        tracing::warn!(target = "polystore", path = %child_path, %err, "skipping unreadable subdirectory");
                    }
                }
            }
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::error::StoreError;

    /// In-memory tree: path to entries at that level. Paths missing from
    /// the map fail with the configured error kind.
    struct FakeLister {
        levels: BTreeMap<String, Vec<FileEntry>>,
        failure: fn(String) -> StoreError,
        calls: Vec<String>,
    }

    impl FakeLister {
        fn new(failure: fn(String) -> StoreError) -> Self {
            Self {
                levels: BTreeMap::new(),
                failure,
                calls: Vec::new(),
            }
        }

        fn level(mut self, path: &str, entries: Vec<FileEntry>) -> Self {
            self.levels.insert(path.to_string(), entries);
            self
        }
    }

    #[async_trait]
    impl LevelLister for FakeLister {
        async fn list_level(&mut self, path: &str) -> StoreResult<Vec<FileEntry>> {
            self.calls.push(path.to_string());
            self.levels
                .get(path)
                .cloned()
                .ok_or_else(|| (self.failure)(path.to_string()))
        }
    }

    fn sample_tree() -> FakeLister {
        FakeLister::new(|p| StoreError::Protocol(format!("no such path {p}")))
            .level(
                "/data",
                vec![
                    FileEntry::file("/data", "a.txt", 3),
                    FileEntry::directory("/data", "sub"),
                ],
            )
            .level(
                "/data/sub",
                vec![
                    FileEntry::file("/data/sub", "b.txt", 5),
                    FileEntry::directory("/data/sub", "deep"),
                ],
            )
            .level("/data/sub/deep", vec![FileEntry::file("/data/sub/deep", "c.txt", 1)])
    }

    #[tokio::test]
    async fn shallow_listing_ignores_depth_flags() {
        let mut lister = sample_tree();
        let entries = walk(&mut lister, "/data", false, false, -1).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.children.is_none()));
        assert_eq!(lister.calls, vec!["/data"]);
    }

    #[tokio::test]
    async fn nested_walk_fills_children() {
        let mut lister = sample_tree();
        let entries = walk(&mut lister, "/data", true, false, -1).await.unwrap();
        assert_eq!(entries.len(), 2);
        let sub = &entries[1];
        let children = sub.children.as_ref().unwrap();
        assert_eq!(children.len(), 2);
        let deep = children[1].children.as_ref().unwrap();
        assert_eq!(deep[0].filename, "c.txt");
    }

    #[tokio::test]
    async fn nested_walk_honors_max_depth() {
        let mut lister = sample_tree();
        let entries = walk(&mut lister, "/data", true, false, 1).await.unwrap();
        let sub = entries[1].children.as_ref().unwrap();
        // Depth two is out of bounds, so "deep" was never listed.
        assert!(sub[1].children.is_none());
        assert!(!lister.calls.contains(&"/data/sub/deep".to_string()));
    }

    #[tokio::test]
    async fn depth_zero_deep_walk_stays_at_the_top_level() {
        let mut lister = sample_tree();
        let entries = walk(&mut lister, "/data", true, true, 0).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert_eq!(lister.calls, vec!["/data"]);
    }

    #[tokio::test]
    async fn flat_walk_hoists_descendants_and_keeps_directories() {
        let mut lister = sample_tree();
        let entries = walk(&mut lister, "/data", true, true, -1).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub", "b.txt", "deep", "c.txt"]);
        assert!(entries.iter().all(|e| e.children.is_none()));
    }

    #[tokio::test]
    async fn unreadable_branch_is_pruned_not_fatal() {
        let mut lister = FakeLister::new(|p| StoreError::Protocol(format!("denied {p}")))
            .level(
                "/data",
                vec![
                    FileEntry::directory("/data", "locked"),
                    FileEntry::file("/data", "ok.txt", 2),
                ],
            );
        let entries = walk(&mut lister, "/data", true, true, -1).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["locked", "ok.txt"]);
    }

    #[tokio::test]
    async fn transient_failure_aborts_the_walk() {
        let mut lister = FakeLister::new(|_| StoreError::Connection("reset".into())).level(
            "/data",
            vec![FileEntry::directory("/data", "sub")],
        );
        let err = walk(&mut lister, "/data", true, false, -1).await.unwrap_err();
        assert!(err.is_transient());
    }
}
