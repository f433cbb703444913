use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use russh::client;
use russh::keys::{load_secret_key, ssh_key, PrivateKeyWithHashAlg};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{Connector, ResumeToken};
use crate::entry::{join_path, FileEntry};
use crate::error::{StoreError, StoreResult};
use crate::profile::ConnectionProfile;
use crate::retry::{RetryState, SessionState};
use crate::walk::{walk, LevelLister};

// An unconfigured profile fails fast; retries are strictly opt-in.
const DEFAULT_RETRIES: i64 = 0;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The remote host is taken at face value, as the profile names it
/// explicitly; there is no known-hosts bookkeeping.
struct AcceptHostKey;

impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Live SSH session with its SFTP subsystem channel.
struct SshConn {
    sftp: SftpSession,
    handle: client::Handle<AcceptHostKey>,
}

struct SftpState {
    conn: Option<SshConn>,
    retry: RetryState,
    phase: SessionState,
}

/// Connector for an SFTP endpoint over SSH.
///
/// Authentication is by password, or by private key when the profile's
/// `privateKey` option names a key file. Like the FTP connector, one
/// session is held behind a mutex and replaced through the retry machine
/// on transient failures.
pub struct SftpConnector {
    alias: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    private_key: Option<String>,
    keep_alive: Option<u64>,
    state: Mutex<SftpState>,
}

impl SftpConnector {
    pub fn new(profile: ConnectionProfile) -> StoreResult<Self> {
        let profile = profile.validate()?;
        let retries = profile.options.get_i64("retries").unwrap_or(DEFAULT_RETRIES);
        Ok(Self {
            alias: profile.alias.clone(),
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            password: profile.password.clone(),
            private_key: profile.options.get_str("privateKey").map(str::to_string),
            keep_alive: profile
                .options
                .get_i64("keepAliveSecond")
                .and_then(|v| u64::try_from(v).ok()),
            state: Mutex::new(SftpState {
                conn: None,
                retry: RetryState::new(retries as i32),
                phase: SessionState::Disconnected,
            }),
        })
    }

    async fn open_session(&self) -> StoreResult<SshConn> {
        let config = Arc::new(client::Config {
            keepalive_interval: self.keep_alive.map(Duration::from_secs),
            ..Default::default()
        });
        let addr = (self.host.as_str(), self.port);
        let mut handle =
            tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, AcceptHostKey))
                .await
                .map_err(|_| {
                    StoreError::Connection(format!(
                        "ssh connect to {}:{} timed out",
                        self.host, self.port
                    ))
                })?
                .map_err(classify_ssh)?;

        let auth = match &self.private_key {
            Some(key_path) => {
                let key = load_secret_key(key_path, None).map_err(|err| {
                    StoreError::Configuration(format!("cannot load private key: {err}"))
                })?;
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(classify_ssh)?
                    .flatten();
                handle
                    .authenticate_publickey(
                        &self.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(classify_ssh)?
            }
            None => handle
                .authenticate_password(&self.username, &self.password)
                .await
                .map_err(classify_ssh)?,
        };
        if !auth.success() {
            return Err(StoreError::Protocol(format!(
                "authentication rejected for user {}",
                self.username
            )));
        }

        let channel = handle.channel_open_session().await.map_err(classify_ssh)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(classify_ssh)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(classify)?;
        Ok(SshConn { sftp, handle })
    }

    async fn establish(&self, state: &mut SftpState) -> bool {
        state.phase = SessionState::Reconnecting;
        if let Some(old) = state.conn.take() {
            let _ = old
                .handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
        }
        match self.open_session().await {
            Ok(conn) => {
                tracing::info!(target = "polystore", alias = %self.alias, host = %self.host, port = self.port, "session established");
                state.conn = Some(conn);
                state.phase = SessionState::Connected;
                true
            }
            Err(err) => {
                tracing::warn!(target = "polystore", alias = %self.alias, host = %self.host, port = self.port, %err, "connect failed");
                state.phase = SessionState::Disconnected;
                false
            }
        }
    }

    async fn run<T, F>(&self, op: &'static str, mut f: F) -> StoreResult<T>
    where
        T: Send,
        F: for<'s> FnMut(&'s SftpSession) -> BoxFuture<'s, StoreResult<T>> + Send,
    {
        let mut state = self.state.lock().await;
        loop {
            if state.conn.is_none() || state.retry.stale() {
                if !self.establish(&mut state).await {
                    if !state.retry.on_transient_failure() {
                        return Err(StoreError::Connection(format!(
                            "{op}: reconnect budget exhausted"
                        )));
                    }
                    continue;
                }
            }
            let Some(conn) = state.conn.as_ref() else {
                continue;
            };
            match f(&conn.sftp).await {
                Ok(value) => {
                    state.retry.reset();
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    state.conn = None;
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
impl Connector for SftpConnector {
    fn kind(&self) -> &str {
        "sftp"
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn connect(&self) -> bool {
        let mut state = self.state.lock().await;
        self.establish(&mut state).await
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.conn.take() {
            let _ = conn
                .handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
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
            .run("list", |sftp| {
                let path = path.to_string();
                Box::pin(async move {
                    let mut lister = SftpLister { sftp };
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
            .run("peek", |sftp| {
                let full = full.clone();
                Box::pin(async move { sftp.metadata(&full).await.map_err(classify) })
            })
            .await;
        match result {
            Ok(attrs) => {
                let is_dir = attrs.is_dir();
                Some(FileEntry {
                    absolute_path: path.to_string(),
                    filename: filename.to_string(),
                    size: attrs.size,
                    is_file: !is_dir,
                    is_directory: is_dir,
                    children: None,
                    native: None,
                })
            }
            Err(err) => {
                tracing::debug!(target = "polystore", alias = %self.alias, path, filename, %err, "metadata lookup failed");
                None
            }
        }
    }

    async fn upload(&self, content: &[u8], path: &str, filename: &str) -> bool {
        let full = join_path(path, filename);
        let result = self
            .run("upload", |sftp| {
                let path = path.to_string();
                let full = full.clone();
                let content = content.to_vec();
                Box::pin(async move {
                    ensure_directories(sftp, &path).await?;
                    let mut file = sftp
                        .open_with_flags(
                            &full,
                            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                        )
                        .await
                        .map_err(classify)?;
                    file.write_all(&content).await.map_err(io_err)?;
                    file.shutdown().await.map_err(io_err)?;
                    Ok(())
                })
            })
            .await;
        log_outcome(&self.alias, "upload", &full, result)
    }

    async fn download(&self, path: &str, filename: &str) -> Option<Bytes> {
        let full = join_path(path, filename);
        let result = self
            .run("download", |sftp| {
                let full = full.clone();
                Box::pin(async move {
                    let mut file = sftp
                        .open_with_flags(&full, OpenFlags::READ)
                        .await
                        .map_err(classify)?;
                    let mut content = Vec::new();
                    file.read_to_end(&mut content).await.map_err(io_err)?;
                    Ok(Bytes::from(content))
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
            .run("create_directory", |sftp| {
                let path = path.to_string();
                Box::pin(async move { ensure_directories(sftp, &path).await })
            })
            .await;
        log_outcome(&self.alias, "create_directory", path, result)
    }

    async fn delete_file(&self, path: &str, filename: &str) -> bool {
        let full = join_path(path, filename);
        let result = self
            .run("delete", |sftp| {
                let full = full.clone();
                Box::pin(async move { sftp.remove_file(&full).await.map_err(classify) })
            })
            .await;
        match result {
            Ok(()) => true,
            Err(err) => {
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
            .run("appender_upload", |sftp| {
                let path = path.to_string();
                let full = full.clone();
                let chunk = chunk.to_vec();
                Box::pin(async move {
                    if offset == 0 {
                        ensure_directories(sftp, &path).await?;
                    } else {
                        let attrs = sftp.metadata(&full).await.map_err(classify)?;
                        let current = attrs.size.unwrap_or(0);
                        if current != offset {
                            return Err(StoreError::Format(format!(
                                "append offset {offset} does not match remote size {current}"
                            )));
                        }
                    }
                    let mut file = sftp
                        .open_with_flags(&full, chunk_open_flags(offset))
                        .await
                        .map_err(classify)?;
                    file.seek(std::io::SeekFrom::Start(offset))
                        .await
                        .map_err(io_err)?;
                    file.write_all(&chunk).await.map_err(io_err)?;
                    file.shutdown().await.map_err(io_err)?;

                    let expected = offset + chunk.len() as u64;
                    let attrs = sftp.metadata(&full).await.map_err(classify)?;
                    if attrs.size.unwrap_or(0) != expected {
                        return Err(StoreError::Protocol(format!(
                            "append landed at {:?} bytes, expected {expected}",
                            attrs.size
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

struct SftpLister<'a> {
    sftp: &'a SftpSession,
}

#[async_trait]
impl LevelLister for SftpLister<'_> {
    async fn list_level(&mut self, path: &str) -> StoreResult<Vec<FileEntry>> {
        let dir = self.sftp.read_dir(path).await.map_err(classify)?;
        let mut entries = Vec::new();
        for entry in dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let attrs = entry.metadata();
            let is_dir = attrs.is_dir();
            entries.push(FileEntry {
                absolute_path: path.to_string(),
                filename: name,
                size: attrs.size,
                is_file: !is_dir,
                is_directory: is_dir,
                children: None,
                native: None,
            });
        }
        Ok(entries)
    }
}

/// The first chunk creates the object, truncating anything already at
/// that path; later chunks must leave the verified prefix in place.
fn chunk_open_flags(offset: u64) -> OpenFlags {
    if offset == 0 {
        OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
    } else {
        OpenFlags::CREATE | OpenFlags::WRITE
    }
}

/// Create each missing path segment. A `Failure` status usually means
/// the directory already exists; a metadata probe settles it.
async fn ensure_directories(sftp: &SftpSession, path: &str) -> StoreResult<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match sftp.create_dir(&current).await {
            Ok(()) => {}
            Err(SftpError::Status(s)) if s.status_code == StatusCode::Failure => {
                sftp.metadata(&current).await.map_err(classify)?;
            }
            Err(err) => return Err(classify(err)),
        }
    }
    Ok(())
}

fn classify(err: SftpError) -> StoreError {
    match err {
        SftpError::Timeout
        | SftpError::IO(_)
        | SftpError::Limited(_)
        | SftpError::UnexpectedPacket
        | SftpError::UnexpectedBehavior(_) => StoreError::Connection(err.to_string()),
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoConnection | StatusCode::ConnectionLost | StatusCode::BadMessage => {
                StoreError::Connection(status.error_message)
            }
            StatusCode::NoSuchFile => {
                StoreError::Protocol(format!("no such file: {}", status.error_message))
            }
            code => StoreError::Protocol(format!("{code:?}: {}", status.error_message)),
        },
    }
}

// Transport-level failures only reach us while (re)establishing the
// session, where every outcome is treated the same way.
fn classify_ssh(err: russh::Error) -> StoreError {
    StoreError::Connection(err.to_string())
}

fn io_err(err: std::io::Error) -> StoreError {
    StoreError::Connection(format!("channel i/o: {err}"))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_chunk_truncates_any_leftover_object() {
        assert!(chunk_open_flags(0).contains(OpenFlags::TRUNCATE));
        assert!(!chunk_open_flags(512).contains(OpenFlags::TRUNCATE));
        assert!(chunk_open_flags(512).contains(OpenFlags::WRITE));
    }

    #[test]
    fn timeouts_classify_as_transient() {
        assert!(classify(SftpError::Timeout).is_transient());
        assert!(classify(SftpError::UnexpectedPacket).is_transient());
    }

    #[tokio::test]
    async fn construction_never_touches_the_network() {
        let profile = ConnectionProfile::new("sftp", "203.0.113.10", 22)
            .with_credentials("deploy", "pw")
            .with_alias("offline")
            .with_option("keepAliveSecond", 30);
        let connector = SftpConnector::new(profile).unwrap();
        assert_eq!(connector.kind(), "sftp");
        assert_eq!(connector.keep_alive, Some(30));
        assert!(connector.private_key.is_none());
    }

    #[tokio::test]
    async fn key_option_accepts_both_spellings() {
        let profile = ConnectionProfile::new("sftp", "h", 22)
            .with_credentials("u", "")
            .with_option("private-key", "/etc/keys/id_ed25519");
        let connector = SftpConnector::new(profile).unwrap();
        assert_eq!(connector.private_key.as_deref(), Some("/etc/keys/id_ed25519"));
    }

    #[tokio::test]
    async fn retries_default_to_zero_unless_configured() {
        let plain = SftpConnector::new(
            ConnectionProfile::new("sftp", "h", 22).with_credentials("u", "pw"),
        )
        .unwrap();
        assert_eq!(plain.state.lock().await.retry.max_retries(), 0);

        let tuned = SftpConnector::new(
            ConnectionProfile::new("sftp", "h", 22)
                .with_credentials("u", "pw")
                .with_option("retries", 2),
        )
        .unwrap();
        assert_eq!(tuned.state.lock().await.retry.max_retries(), 2);
    }
}
