use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{Connector, ResumeToken};
use crate::entry::{FileEntry, NativeRecord};
use crate::error::{StoreError, StoreResult};
use crate::profile::ConnectionProfile;
use crate::walk::{walk, LevelLister};

/// Bucket-plus-key address. An empty key denotes the bucket root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BucketLocation {
    pub bucket: String,
    pub key: String,
}

/// Concatenate `path` and `filename`, fold away duplicate slashes, and
/// split the first segment off as the bucket.
pub(crate) fn resolve(path: &str, filename: &str) -> Option<BucketLocation> {
    let combined = format!("{}/{}", path.trim(), filename.trim());
    let mut segments = combined.split('/').filter(|s| !s.is_empty());
    let bucket = segments.next()?.to_string();
    let key: Vec<&str> = segments.collect();
    Some(BucketLocation {
        bucket,
        key: key.join("/"),
    })
}

/// Split an object key into its directory part and leaf name.
fn split_key(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((dir, leaf)) => (dir, leaf),
        None => ("", key),
    }
}

/// Depth of a key relative to the listing prefix: direct children sit at
/// depth one, like the client-side walk counts.
fn within_relative_depth(relative: &str, max_depth: i32) -> bool {
    max_depth < 0 || relative.matches('/').count() as i32 <= max_depth
}

/// One listed object as a flat entry. Folder markers (trailing-slash
/// keys) and keys outside the depth bound drop out; everything that
/// survives is a plain file, never a directory.
fn flat_object_entry(
    bucket: &str,
    prefix: &str,
    key: &str,
    size: u64,
    etag: Option<&str>,
    max_depth: i32,
) -> Option<FileEntry> {
    if key.ends_with('/') {
        return None;
    }
    let relative = key.strip_prefix(prefix).unwrap_or(key);
    if relative.is_empty() || !within_relative_depth(relative, max_depth) {
        return None;
    }
    let (dir, leaf) = split_key(key);
    let parent = if dir.is_empty() {
        format!("/{bucket}")
    } else {
        format!("/{bucket}/{dir}")
    };
    let mut entry = FileEntry::file(parent, leaf, size);
    if let Some(etag) = etag {
        let mut native = NativeRecord::new();
        native.insert("etag".to_string(), etag.trim_matches('"').to_string());
        entry = entry.with_native(native);
    }
    Some(entry)
}

/// Connector for an S3-compatible bucket store such as MinIO.
///
/// The SDK manages its own connection pool, so this connector carries no
/// session state and is safe for concurrent callers. Directories are a
/// key-prefix convention; explicit ones are marked with an empty
/// trailing-slash object.
pub struct MinioConnector {
    alias: String,
    client: Client,
    can_create_bucket: bool,
    can_delete_folder_recursive: bool,
}

impl MinioConnector {
    pub fn new(profile: ConnectionProfile) -> StoreResult<Self> {
        let profile = profile.validate()?;
        let secure = profile.options.get_bool("secure").unwrap_or(false);
        let scheme = if secure { "https" } else { "http" };
        let endpoint = format!("{scheme}://{}", profile.endpoint());
        let region = profile
            .options
            .get_str("region")
            .unwrap_or("us-east-1")
            .to_string();
        let credentials = Credentials::new(
            profile.username.clone(),
            profile.password.clone(),
            None,
            None,
            "connection-profile",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Ok(Self {
            alias: profile.alias.clone(),
            client: Client::from_conf(config),
            can_create_bucket: profile.options.get_bool("canCreateBucket").unwrap_or(false),
            can_delete_folder_recursive: profile
                .options
                .get_bool("canDeleteFolderRecursive")
                .unwrap_or(false),
        })
    }

    /// One native recursive-prefix query per bucket; the server walks the
    /// tree, not this client. Marker objects drop out, so the result never
    /// contains a directory entry.
    async fn list_flat_native(
        &self,
        bucket: &str,
        key: &str,
        max_depth: i32,
    ) -> StoreResult<Vec<FileEntry>> {
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(map_sdk_error)?;
            for obj in page.contents() {
                let Some(full_key) = obj.key() else { continue };
                let size = obj.size().unwrap_or(0) as u64;
                if let Some(entry) =
                    flat_object_entry(bucket, &prefix, full_key, size, obj.e_tag(), max_depth)
                {
                    entries.push(entry);
                }
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn list_buckets_as_entries(&self) -> StoreResult<Vec<FileEntry>> {
        let resp = self.client.list_buckets().send().await.map_err(map_sdk_error)?;
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|bucket| bucket.name())
            .map(|name| FileEntry::directory("/", name))
            .collect())
    }

    async fn bucket_exists(&self, bucket: &str) -> bool {
        self.client.head_bucket().bucket(bucket).send().await.is_ok()
    }

    async fn ensure_bucket(&self, bucket: &str) -> StoreResult<()> {
        if self.bucket_exists(bucket).await {
            return Ok(());
        }
        if !self.can_create_bucket {
            return Err(StoreError::Protocol(format!(
                "bucket {bucket} does not exist and bucket creation is disabled"
            )));
        }
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(map_sdk_error)?;
        tracing::info!(target = "polystore", alias = %self.alias, bucket, "bucket created");
        Ok(())
    }

    async fn object_size(&self, bucket: &str, key: &str) -> Option<u64> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(head) => Some(head.content_length().unwrap_or(0) as u64),
            Err(err) => {
                let service = err.into_service_error();
                if !service.is_not_found() {
                    tracing::warn!(target = "polystore", alias = %self.alias, bucket, key, err = %service, "head request failed");
                }
                None
            }
        }
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Connection(format!("object body read failed: {err}")))?;
        Ok(data.into_bytes())
    }

    async fn put_object(&self, bucket: &str, key: &str, content: Bytes) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(S3ByteStream::from(content))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    /// Delete everything under `key/`, returning how many objects went.
    async fn delete_prefix(&self, bucket: &str, key: &str) -> StoreResult<usize> {
        let prefix = format!("{key}/");
        let mut deleted = 0;
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(map_sdk_error)?;
            for obj in page.contents() {
                let Some(obj_key) = obj.key() else { continue };
                self.client
                    .delete_object()
                    .bucket(bucket)
                    .key(obj_key)
                    .send()
                    .await
                    .map_err(map_sdk_error)?;
                deleted += 1;
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(deleted)
    }
}

/// One delimiter-scoped level: common prefixes become directory entries,
/// objects become files, marker objects are hidden.
struct MinioLister<'a> {
    client: &'a Client,
}

impl MinioLister<'_> {
    async fn list_level_inner(&self, path: &str) -> StoreResult<Vec<FileEntry>> {
        let Some(loc) = resolve(path, "") else {
            // No bucket segment: this is the account root.
            let resp = self.client.list_buckets().send().await.map_err(map_sdk_error)?;
            return Ok(resp
                .buckets()
                .iter()
                .filter_map(|b| b.name())
                .map(|name| FileEntry::directory("/", name))
                .collect());
        };
        let prefix = if loc.key.is_empty() {
            String::new()
        } else {
            format!("{}/", loc.key)
        };
        let display_path = if loc.key.is_empty() {
            format!("/{}", loc.bucket)
        } else {
            format!("/{}/{}", loc.bucket, loc.key)
        };

        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&loc.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(map_sdk_error)?;
            for common in page.common_prefixes() {
                let Some(dir_prefix) = common.prefix() else { continue };
                let name = dir_prefix
                    .strip_prefix(&prefix)
                    .unwrap_or(dir_prefix)
                    .trim_end_matches('/');
                if !name.is_empty() {
                    entries.push(FileEntry::directory(display_path.clone(), name));
                }
            }
            for obj in page.contents() {
                let Some(full_key) = obj.key() else { continue };
                if full_key.ends_with('/') {
                    continue;
                }
                let name = full_key.strip_prefix(&prefix).unwrap_or(full_key);
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                entries.push(FileEntry::file(
                    display_path.clone(),
                    name,
                    obj.size().unwrap_or(0) as u64,
                ));
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl LevelLister for MinioLister<'_> {
    async fn list_level(&mut self, path: &str) -> StoreResult<Vec<FileEntry>> {
        self.list_level_inner(path).await
    }
}

#[async_trait]
impl Connector for MinioConnector {
    fn kind(&self) -> &str {
        "minio"
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> bool {
        match self.client.list_buckets().send().await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, err = %map_sdk_error(err), "endpoint probe failed");
                false
            }
        }
    }

    async fn disconnect(&self) {}

    async fn list(
        &self,
        path: &str,
        deep_find: bool,
        flat_print: bool,
        max_depth: i32,
    ) -> Option<Vec<FileEntry>> {
        let result = if deep_find && flat_print {
            match resolve(path, "") {
                Some(loc) => self.list_flat_native(&loc.bucket, &loc.key, max_depth).await,
                None => {
                    // Account root: one native recursive query per bucket.
                    match self.list_buckets_as_entries().await {
                        Ok(buckets) => {
                            let mut all = Vec::new();
                            let mut failed = None;
                            for bucket in buckets {
                                match self
                                    .list_flat_native(&bucket.filename, "", max_depth)
                                    .await
                                {
                                    Ok(entries) => all.extend(entries),
                                    Err(err) => {
                                        failed = Some(err);
                                        break;
                                    }
                                }
                            }
                            match failed {
                                Some(err) => Err(err),
                                None => Ok(all),
                            }
                        }
                        Err(err) => Err(err),
                    }
                }
            }
        } else {
            let mut lister = MinioLister {
                client: &self.client,
            };
            walk(&mut lister, path, deep_find, flat_print, max_depth).await
        };
        match result {
            Ok(entries) => Some(entries),
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, path, %err, "listing failed");
                None
            }
        }
    }

    async fn peek_file(&self, path: &str, filename: &str) -> Option<FileEntry> {
        let loc = resolve(path, filename)?;
        if loc.key.is_empty() {
            return None;
        }
        let size = self.object_size(&loc.bucket, &loc.key).await?;
        let (dir, leaf) = split_key(&loc.key);
        let parent = if dir.is_empty() {
            format!("/{}", loc.bucket)
        } else {
            format!("/{}/{}", loc.bucket, dir)
        };
        Some(FileEntry::file(parent, leaf, size))
    }

    async fn upload(&self, content: &[u8], path: &str, filename: &str) -> bool {
        let Some(loc) = resolve(path, filename) else {
            tracing::warn!(target = "polystore", alias = %self.alias, path, filename, "upload target has no bucket");
            return false;
        };
        if loc.key.is_empty() {
            tracing::warn!(target = "polystore", alias = %self.alias, path, filename, "upload target has no object key");
            return false;
        }
        let result = async {
            self.ensure_bucket(&loc.bucket).await?;
            self.put_object(&loc.bucket, &loc.key, Bytes::copy_from_slice(content))
                .await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, bucket = %loc.bucket, key = %loc.key, %err, "upload failed");
                false
            }
        }
    }

    async fn download(&self, path: &str, filename: &str) -> Option<Bytes> {
        let loc = resolve(path, filename)?;
        if loc.key.is_empty() {
            return None;
        }
        match self.fetch_object(&loc.bucket, &loc.key).await {
            Ok(content) => Some(content),
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, bucket = %loc.bucket, key = %loc.key, %err, "download failed");
                None
            }
        }
    }

    async fn create_directory(&self, path: &str) -> bool {
        let Some(loc) = resolve(path, "") else {
            return false;
        };
        let result = if loc.key.is_empty() {
            self.ensure_bucket(&loc.bucket).await
        } else {
            async {
                self.ensure_bucket(&loc.bucket).await?;
                self.put_object(&loc.bucket, &format!("{}/", loc.key), Bytes::new())
                    .await
            }
            .await
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, bucket = %loc.bucket, key = %loc.key, %err, "create directory failed");
                false
            }
        }
    }

    /// Deleting an object key that exists removes it. A key that only
    /// exists as a prefix is a pseudo-folder; removing one is allowed
    /// only when the profile opted in, and then takes every object under
    /// it. Deletes on S3 succeed for absent keys, so existence is probed
    /// first to keep the idempotent-failure contract.
    async fn delete_file(&self, path: &str, filename: &str) -> bool {
        let Some(loc) = resolve(path, filename) else {
            return false;
        };
        if loc.key.is_empty() {
            return false;
        }
        if self.object_size(&loc.bucket, &loc.key).await.is_some() {
            return match self
                .client
                .delete_object()
                .bucket(&loc.bucket)
                .key(&loc.key)
                .send()
                .await
            {
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!(target = "polystore", alias = %self.alias, bucket = %loc.bucket, key = %loc.key, err = %map_sdk_error(err), "delete failed");
                    false
                }
            };
        }

        let probe = self
            .client
            .list_objects_v2()
            .bucket(&loc.bucket)
            .prefix(format!("{}/", loc.key))
            .max_keys(1)
            .send()
            .await;
        let is_pseudo_folder = matches!(&probe, Ok(page) if !page.contents().is_empty());
        if !is_pseudo_folder {
            return false;
        }
        if !self.can_delete_folder_recursive {
            tracing::warn!(target = "polystore", alias = %self.alias, bucket = %loc.bucket, key = %loc.key, "recursive folder delete is disabled");
            return false;
        }
        match self.delete_prefix(&loc.bucket, &loc.key).await {
            Ok(count) => {
                tracing::info!(target = "polystore", alias = %self.alias, bucket = %loc.bucket, key = %loc.key, objects = count, "folder deleted");
                true
            }
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, bucket = %loc.bucket, key = %loc.key, %err, "recursive delete failed");
                false
            }
        }
    }

    /// The store has no append primitive, so resumable uploads are
    /// simulated: fetch what is there, verify the offset, re-put the
    /// concatenation.
    async fn appender_upload(
        &self,
        chunk: &[u8],
        path: &str,
        filename: &str,
        offset: u64,
    ) -> Option<ResumeToken> {
        let loc = resolve(path, filename)?;
        if loc.key.is_empty() {
            return None;
        }
        let result = async {
            if offset == 0 {
                self.ensure_bucket(&loc.bucket).await?;
                self.put_object(&loc.bucket, &loc.key, Bytes::copy_from_slice(chunk))
                    .await
            } else {
                let current = self.fetch_object(&loc.bucket, &loc.key).await?;
                if current.len() as u64 != offset {
                    return Err(StoreError::Format(format!(
                        "append offset {offset} does not match stored size {}",
                        current.len()
                    )));
                }
                let mut combined = Vec::with_capacity(current.len() + chunk.len());
                combined.extend_from_slice(&current);
                combined.extend_from_slice(chunk);
                self.put_object(&loc.bucket, &loc.key, Bytes::from(combined))
                    .await
            }
        }
        .await;
        match result {
            Ok(()) => Some(ResumeToken {
                path: format!("/{}", loc.bucket),
                filename: loc.key,
            }),
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, bucket = %loc.bucket, key = %loc.key, offset, %err, "append failed");
                None
            }
        }
    }
}

/// The SDK folds service and dispatch failures into one error type; the
/// message is the only uniform place the distinction survives.
fn map_sdk_error(err: impl std::fmt::Display) -> StoreError {
    let msg = err.to_string();
    if msg.contains("NoSuchKey") || msg.contains("NoSuchBucket") || msg.contains("NotFound") || msg.contains("404") {
        StoreError::Protocol(format!("not found: {msg}"))
    } else if msg.contains("dispatch failure") || msg.contains("timeout") || msg.contains("connection") {
        StoreError::Connection(msg)
    } else {
        StoreError::Protocol(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bucket_and_key_from_any_split() {
        let expected = BucketLocation {
            bucket: "assets".to_string(),
            key: "img/logo.png".to_string(),
        };
        assert_eq!(resolve("/assets/img", "logo.png").unwrap(), expected);
        assert_eq!(resolve("assets", "img/logo.png").unwrap(), expected);
        assert_eq!(resolve("", "/assets/img/logo.png").unwrap(), expected);
    }

    #[test]
    fn bucket_root_has_empty_key() {
        let loc = resolve("/assets/", "").unwrap();
        assert_eq!(loc.bucket, "assets");
        assert_eq!(loc.key, "");
        assert!(resolve("", "").is_none());
    }

    #[test]
    fn doubled_slashes_fold_away() {
        let loc = resolve("assets//img/", "/logo.png").unwrap();
        assert_eq!(loc.key, "img/logo.png");
    }

    #[test]
    fn relative_depth_matches_walk_counting() {
        // Direct children sit at depth one.
        assert!(within_relative_depth("file.txt", 0));
        assert!(!within_relative_depth("a/file.txt", 0));
        assert!(within_relative_depth("a/file.txt", 1));
        assert!(within_relative_depth("a/b/file.txt", -1));
    }

    #[test]
    fn key_splits_into_parent_and_leaf() {
        assert_eq!(split_key("a/b/c.txt"), ("a/b", "c.txt"));
        assert_eq!(split_key("c.txt"), ("", "c.txt"));
    }

    #[test]
    fn flat_listing_yields_files_only() {
        // Folder markers and the prefix's own marker drop out.
        assert!(flat_object_entry("media", "", "logs/", 0, None, -1).is_none());
        assert!(flat_object_entry("media", "logs/", "logs/", 0, None, -1).is_none());

        for key in ["a.txt", "logs/app.log", "logs/2024/q1/app.log"] {
            let entry = flat_object_entry("media", "", key, 7, None, -1).unwrap();
            assert!(entry.is_file);
            assert!(!entry.is_directory);
        }

        let entry = flat_object_entry("media", "logs/", "logs/2024/app.log", 7, Some("\"abc\""), -1)
            .unwrap();
        assert_eq!(entry.absolute_path, "/media/logs/2024");
        assert_eq!(entry.filename, "app.log");
        assert_eq!(entry.native.as_ref().unwrap()["etag"], "abc");

        // Depth counts relative to the listing prefix.
        assert!(flat_object_entry("media", "logs/", "logs/2024/q1/app.log", 7, None, 1).is_none());
    }

    #[test]
    fn sdk_errors_classify_by_message() {
        assert!(matches!(map_sdk_error("NoSuchKey: gone"), StoreError::Protocol(_)));
        assert!(map_sdk_error("dispatch failure: io error").is_transient());
        assert!(matches!(map_sdk_error("AccessDenied"), StoreError::Protocol(_)));
    }

    #[test]
    fn construction_never_touches_the_network() {
        let profile = ConnectionProfile::new("minio", "203.0.113.20", 9000)
            .with_credentials("minioadmin", "secret")
            .with_alias("offline")
            .with_option("canCreateBucket", true);
        let connector = MinioConnector::new(profile).unwrap();
        assert_eq!(connector.kind(), "minio");
        assert!(connector.can_create_bucket);
        assert!(!connector.can_delete_folder_recursive);
    }
}
