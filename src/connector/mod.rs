//! The storage connector contract and the backends implementing it.
//!
//! A [`Connector`] wraps one remote store behind a uniform, infallible
//! surface: operations return `bool` or `Option` and log the underlying
//! cause instead of surfacing backend errors to the caller. The only
//! fallible step in a connector's life is profile validation at
//! construction time.

use std::pin::Pin;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::stream::Stream;
use futures::TryStreamExt;

use crate::entry::FileEntry;
use crate::error::{StoreError, StoreResult};

#[cfg(feature = "fdfs")]
pub mod fdfs;
#[cfg(feature = "ftp")]
pub mod ftp;
pub mod memory;
#[cfg(feature = "minio")]
pub mod minio;
#[cfg(feature = "sftp")]
pub mod sftp;

/// Byte stream used for streaming uploads and downloads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StoreError>> + Send>>;

/// Where a resumable upload actually landed.
///
/// Backends may store the object under a location that differs from the
/// requested one (FastDFS assigns the remote filename itself). The token
/// returned by the first chunk carries the authoritative location; later
/// chunks address the object through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    pub path: String,
    pub filename: String,
}

/// Uniform asynchronous interface over one remote storage backend.
///
/// Implementations keep whatever session state they need behind `&self`;
/// callers never observe connection management beyond the optional
/// [`connect`](Connector::connect) warm-up.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Backend tag this connector was built for ("ftp", "sftp", ...).
    fn kind(&self) -> &str;

    /// Profile alias, used in log context to tell instances apart.
    fn alias(&self) -> &str;

    /// Establish the session eagerly. Optional; every operation connects
    /// on demand. Returns whether a usable session exists afterwards.
    async fn connect(&self) -> bool;

    /// Tear down the session. Idempotent.
    async fn disconnect(&self);

    /// List `path`, optionally descending into subdirectories.
    ///
    /// `deep_find` enables recursion, bounded by `max_depth` (negative
    /// means unlimited). With `flat_print` the result is a single flat
    /// vector; otherwise descendants hang off their parent's `children`.
    /// `None` means the path could not be listed.
    async fn list(
        &self,
        path: &str,
        deep_find: bool,
        flat_print: bool,
        max_depth: i32,
    ) -> Option<Vec<FileEntry>>;

    /// Metadata for a single file, without its content.
    async fn peek_file(&self, _path: &str, _filename: &str) -> Option<FileEntry> {
        None
    }

    /// Store `content` as `path`/`filename`, creating parent directories
    /// where the backend supports that.
    async fn upload(&self, content: &[u8], path: &str, filename: &str) -> bool;

    /// Store a stream. The default buffers it fully and delegates to
    /// [`upload`](Connector::upload).
    async fn upload_stream(&self, stream: ByteStream, path: &str, filename: &str) -> bool {
        match collect_stream(stream).await {
            Ok(content) => self.upload(&content, path, filename).await,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = self.alias(), %err, "stream upload failed while reading input");
                false
            }
        }
    }

    /// Decode standard base64 (with or without a `data:` URI prefix) and
    /// store the result.
    async fn upload_base64(&self, encoded: &str, path: &str, filename: &str) -> bool {
        match decode_base64(encoded) {
            Ok(content) => self.upload(&content, path, filename).await,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = self.alias(), %err, "base64 upload rejected");
                false
            }
        }
    }

    /// Fetch a file's full content.
    async fn download(&self, path: &str, filename: &str) -> Option<Bytes>;

    /// Fetch a file as a stream. The default wraps the buffered download
    /// in a one-chunk stream.
    async fn download_stream(&self, path: &str, filename: &str) -> Option<ByteStream> {
        let content = self.download(path, filename).await?;
        Some(Box::pin(futures::stream::once(async move { Ok(content) })))
    }

    /// Fetch a file and return it base64-encoded.
    async fn download_base64(&self, path: &str, filename: &str) -> Option<String> {
        let content = self.download(path, filename).await?;
        Some(encode_base64(&content))
    }

    /// Create a directory (and missing parents). Backends without a
    /// directory concept report success for a well-formed path or emulate
    /// one with a marker object.
    async fn create_directory(&self, path: &str) -> bool;

    /// Remove a single file. Removing an absent file reports `false`.
    async fn delete_file(&self, path: &str, filename: &str) -> bool;

    /// Append one chunk of a resumable upload.
    ///
    /// `offset == 0` creates the object and returns a [`ResumeToken`];
    /// later chunks address the object by the token's location and pass
    /// the byte offset the chunk starts at. Backends that cannot append
    /// decline with `None`.
    async fn appender_upload(
        &self,
        _chunk: &[u8],
        _path: &str,
        _filename: &str,
        _offset: u64,
    ) -> Option<ResumeToken> {
        None
    }

    /// Base64 variant of [`appender_upload`](Connector::appender_upload).
    async fn appender_upload_base64(
        &self,
        encoded: &str,
        path: &str,
        filename: &str,
        offset: u64,
    ) -> Option<ResumeToken> {
        match decode_base64(encoded) {
            Ok(chunk) => self.appender_upload(&chunk, path, filename, offset).await,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = self.alias(), %err, "base64 append rejected");
                None
            }
        }
    }
}

/// Decode standard base64, tolerating a leading `data:<mime>;base64,`
/// prefix as produced by browsers.
pub fn decode_base64(input: &str) -> StoreResult<Vec<u8>> {
    let payload = strip_data_uri_prefix(input.trim());
    BASE64
        .decode(payload)
        .map_err(|err| StoreError::Format(format!("invalid base64 payload: {err}")))
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

fn strip_data_uri_prefix(input: &str) -> &str {
    let Some(rest) = input.strip_prefix("data:") else {
        return input;
    };
    let Some(sep) = rest.find(";base64,") else {
        return input;
    };
    let mime = &rest[..sep];
    let well_formed = !mime.is_empty()
        && mime.matches('/').count() <= 1
        && mime
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.' | '+'));
    if well_formed {
        &rest[sep + ";base64,".len()..]
    } else {
        input
    }
}

/// Buffer a [`ByteStream`] into contiguous memory.
pub(crate) async fn collect_stream(stream: ByteStream) -> StoreResult<Vec<u8>> {
    stream
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_base64() {
        assert_eq!(decode_base64("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn strips_data_uri_prefix() {
        let decoded = decode_base64("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(decoded, b"hello");
        let decoded = decode_base64("data:text;base64,aGVsbG8=").unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn malformed_prefix_is_not_stripped() {
        // Two slashes is not a media type; the whole string must decode
        // as base64, which it does not.
        assert!(decode_base64("data:a/b/c;base64,aGVsbG8=").is_err());
    }

    #[test]
    fn rejects_garbage() {
        let err = decode_base64("not//valid!!").unwrap_err();
        assert!(matches!(err, StoreError::Format(_)));
    }

    #[test]
    fn round_trips_binary() {
        let data = [0u8, 255, 17, 42];
        assert_eq!(decode_base64(&encode_base64(&data)).unwrap(), data);
    }

    #[tokio::test]
    async fn collects_multi_chunk_stream() {
        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ]));
        assert_eq!(collect_stream(stream).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn stream_collection_propagates_errors() {
        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(StoreError::Connection("reset".into())),
        ]));
        assert!(collect_stream(stream).await.is_err());
    }
}
