use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::io::Cursor;
use futures::AsyncReadExt;
use suppaftp::types::FileType;
use suppaftp::{AsyncFtpStream, FtpError, Status};
use tokio::sync::Mutex;

use super::{Connector, ResumeToken};
use crate::entry::{join_path, FileEntry};
use crate::error::{StoreError, StoreResult};
use crate::profile::ConnectionProfile;
use crate::retry::{RetryState, SessionState};
use crate::walk::{walk, LevelLister};

// An unconfigured profile fails fast; retries are strictly opt-in.
const DEFAULT_RETRIES: i64 = 0;

struct FtpSession {
    stream: Option<AsyncFtpStream>,
    retry: RetryState,
    phase: SessionState,
}

/// Connector for a plain FTP server.
///
/// One control connection is held for the connector's lifetime. The
/// session lives behind a mutex, so callers are serialized; the retry
/// state machine replaces the connection when an operation hits a
/// transient socket failure.
pub struct FtpConnector {
    alias: String,
    endpoint: String,
    username: String,
    password: String,
    session: Mutex<FtpSession>,
}

impl FtpConnector {
    pub fn new(profile: ConnectionProfile) -> StoreResult<Self> {
        let profile = profile.validate()?;
        let retries = profile.options.get_i64("retries").unwrap_or(DEFAULT_RETRIES);
        Ok(Self {
            alias: profile.alias.clone(),
            endpoint: profile.endpoint(),
            username: profile.username.clone(),
            password: profile.password.clone(),
            session: Mutex::new(FtpSession {
                stream: None,
                retry: RetryState::new(retries as i32),
                phase: SessionState::Disconnected,
            }),
        })
    }

    async fn establish(&self, state: &mut FtpSession) -> bool {
        state.phase = SessionState::Reconnecting;
        if let Some(mut old) = state.stream.take() {
            let _ = old.quit().await;
        }
        let mut stream = match AsyncFtpStream::connect(&self.endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, endpoint = %self.endpoint, err = %classify(err), "connect failed");
                state.phase = SessionState::Disconnected;
                return false;
            }
        };
        if let Err(err) = stream.login(&self.username, &self.password).await {
            tracing::warn!(target = "polystore", alias = %self.alias, user = %self.username, err = %classify(err), "login failed");
            state.phase = SessionState::Disconnected;
            return false;
        }
        if let Err(err) = stream.transfer_type(FileType::Binary).await {
            tracing::warn!(target = "polystore", alias = %self.alias, err = %classify(err), "binary mode failed");
            state.phase = SessionState::Disconnected;
            return false;
        }
        tracing::info!(target = "polystore", alias = %self.alias, endpoint = %self.endpoint, "session established");
        state.stream = Some(stream);
        state.phase = SessionState::Connected;
        true
    }

    /// Run one logical operation against a healthy session, reconnecting
    /// first when the session is absent or marked stale, and retrying the
    /// whole operation on transient failures until the budget runs out.
    async fn run<T, F>(&self, op: &'static str, mut f: F) -> StoreResult<T>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut AsyncFtpStream) -> BoxFuture<'s, StoreResult<T>> + Send,
    {
        let mut state = self.session.lock().await;
        loop {
            if state.stream.is_none() || state.retry.stale() {
                if !self.establish(&mut state).await {
                    if !state.retry.on_transient_failure() {
                        return Err(StoreError::Connection(format!(
                            "{op}: reconnect budget exhausted"
                        )));
                    }
                    continue;
                }
            }
            let Some(stream) = state.stream.as_mut() else {
                continue;
            };
            match f(stream).await {
                Ok(value) => {
                    state.retry.reset();
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    state.stream = None;
                    state.phase = SessionState::Disconnected;
                    if !state.retry.on_transient_failure() {
                        tracing::warn!(target = "polystore", alias = %self.alias, op, session = %state.phase, %err, "giving up after transient failures");
                        return Err(err);
                    }
                    tracing::debug!(target = "polystore", alias = %self.alias, op, session = %state.phase, used = state.retry.used(), %err, "transient failure, reconnecting");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Connector for FtpConnector {
    fn kind(&self) -> &str {
        "ftp"
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> bool {
        let mut state = self.session.lock().await;
        self.establish(&mut state).await
    }

    async fn disconnect(&self) {
        let mut state = self.session.lock().await;
        if let Some(mut stream) = state.stream.take() {
            let _ = stream.quit().await;
        }
        state.phase = SessionState::Disconnected;
    }

    async fn list(
        &self,
        path: &str,
        deep_find: bool,
        flat_print: bool,
        max_depth: i32,
    ) -> Option<Vec<FileEntry>> {
        let result = self
            .run("list", |stream| {
                let path = path.to_string();
                Box::pin(async move {
                    let mut lister = FtpLister { stream };
                    walk(&mut lister, &path, deep_find, flat_print, max_depth).await
                })
            })
            .await;
        match result {
            Ok(entries) => Some(entries),
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, path, %err, "listing failed");
                None
            }
        }
    }

    async fn peek_file(&self, path: &str, filename: &str) -> Option<FileEntry> {
        let full = join_path(path, filename);
        let result = self
            .run("peek", |stream| {
                let full = full.clone();
                Box::pin(async move {
                    let size = stream.size(&full).await.map_err(classify)?;
                    Ok(size as u64)
                })
            })
            .await;
        match result {
            Ok(size) => Some(FileEntry::file(path, filename, size)),
            Err(err) => {
                tracing::debug!(target = "polystore", alias = %self.alias, path, filename, %err, "size probe failed");
                None
            }
        }
    }

    async fn upload(&self, content: &[u8], path: &str, filename: &str) -> bool {
        let full = join_path(path, filename);
        let result = self
            .run("upload", |stream| {
                let path = path.to_string();
                let full = full.clone();
                let content = content.to_vec();
                Box::pin(async move {
                    ensure_directories(stream, &path).await?;
                    let mut reader = Cursor::new(content);
                    stream.put_file(&full, &mut reader).await.map_err(classify)?;
                    Ok(())
                })
            })
            .await;
        log_outcome(&self.alias, "upload", &full, result)
    }

    async fn download(&self, path: &str, filename: &str) -> Option<Bytes> {
        let full = join_path(path, filename);
        let result = self
            .run("download", |stream| {
                let full = full.clone();
                Box::pin(async move {
                    let buffer = stream
                        .retr(&full, |mut data| {
                            Box::pin(async move {
                                let mut buffer = Vec::new();
                                data.read_to_end(&mut buffer)
                                    .await
                                    .map_err(FtpError::ConnectionError)?;
                                Ok((buffer, data))
                            })
                        })
                        .await
                        .map_err(classify)?;
                    Ok(Bytes::from(buffer))
                })
            })
            .await;
        match result {
            Ok(content) => Some(content),
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, path = %full, %err, "download failed");
                None
            }
        }
    }

    async fn create_directory(&self, path: &str) -> bool {
        let result = self
            .run("create_directory", |stream| {
                let path = path.to_string();
                Box::pin(async move { ensure_directories(stream, &path).await })
            })
            .await;
        log_outcome(&self.alias, "create_directory", path, result)
    }

    async fn delete_file(&self, path: &str, filename: &str) -> bool {
        let full = join_path(path, filename);
        let result = self
            .run("delete", |stream| {
                let full = full.clone();
                Box::pin(async move { stream.rm(&full).await.map_err(classify) })
            })
            .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                // Absent files answer 550; deleting twice reports false
                // the second time without raising anything.
                tracing::debug!(target = "polystore", alias = %self.alias, path = %full, %err, "delete reported failure");
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
        let full = join_path(path, filename);
        let result = self
            .run("appender_upload", |stream| {
                let path = path.to_string();
                let full = full.clone();
                let chunk = chunk.to_vec();
                Box::pin(async move {
                    if offset == 0 {
                        ensure_directories(stream, &path).await?;
                        let mut reader = Cursor::new(chunk);
                        stream.put_file(&full, &mut reader).await.map_err(classify)?;
                        return Ok(());
                    }
                    let current = stream.size(&full).await.map_err(classify)? as u64;
                    if current != offset {
                        return Err(StoreError::Format(format!(
                            "append offset {offset} does not match remote size {current}"
                        )));
                    }
                    let expected = offset + chunk.len() as u64;
                    let mut reader = Cursor::new(chunk);
                    stream.append_file(&full, &mut reader).await.map_err(classify)?;
                    let landed = stream.size(&full).await.map_err(classify)? as u64;
                    if landed != expected {
                        return Err(StoreError::Protocol(format!(
                            "append landed at {landed} bytes, expected {expected}"
                        )));
                    }
                    Ok(())
                })
            })
            .await;
        match result {
            Ok(()) => Some(ResumeToken {
                path: path.to_string(),
                filename: filename.to_string(),
            }),
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, path = %full, offset, %err, "append failed");
                None
            }
        }
    }
}

struct FtpLister<'a> {
    stream: &'a mut AsyncFtpStream,
}

#[async_trait]
impl LevelLister for FtpLister<'_> {
    async fn list_level(&mut self, path: &str) -> StoreResult<Vec<FileEntry>> {
        let lines = self.stream.list(Some(path)).await.map_err(classify)?;
        Ok(lines
            .iter()
            .filter_map(|line| parse_list_line(path, line))
            .collect())
    }
}

/// Parse one LIST line; unparseable lines and the dot entries are
/// skipped.
fn parse_list_line(path: &str, line: &str) -> Option<FileEntry> {
    let file = suppaftp::list::File::try_from(line).ok()?;
    let name = file.name();
    if name == "." || name == ".." {
        return None;
    }
    if file.is_directory() {
        Some(FileEntry::directory(path, name))
    } else {
        Some(FileEntry::file(path, name, file.size() as u64))
    }
}

/// Walk `path` segment by segment, entering each directory and creating
/// the ones that do not exist yet.
async fn ensure_directories(stream: &mut AsyncFtpStream, path: &str) -> StoreResult<()> {
    for prefix in directory_prefixes(path) {
        if stream.cwd(&prefix).await.is_ok() {
            continue;
        }
        stream.mkdir(&prefix).await.map_err(classify)?;
    }
    Ok(())
}

/// Cumulative absolute prefixes of a directory path.
fn directory_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

fn classify(err: FtpError) -> StoreError {
    match err {
        FtpError::ConnectionError(io) => StoreError::Connection(format!("control channel: {io}")),
        FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable => {
            StoreError::Protocol(format!(
                "remote reports file unavailable: {}",
                String::from_utf8_lossy(&resp.body).trim()
            ))
        }
        FtpError::UnexpectedResponse(resp) => StoreError::Protocol(format!(
            "unexpected reply {}: {}",
            resp.status as u32,
            String::from_utf8_lossy(&resp.body).trim()
        )),
        other => StoreError::Protocol(other.to_string()),
    }
}

fn log_outcome(alias: &str, op: &str, path: &str, result: StoreResult<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(target = "polystore", alias, op, path, %err, "operation failed");
            false
        }
    }
}
