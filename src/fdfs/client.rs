//! Minimal tracker and storage clients speaking the FastDFS binary
//! protocol over short-lived TCP connections. Every operation opens its
//! own connection, which keeps the clients free of session state.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::proto::{
    self, GroupStat, Header, RemoteFileInfo, StorageNode, StorePath, HEADER_LEN, STATUS_NOT_FOUND,
    STATUS_OK,
};
use crate::error::{StoreError, StoreResult};

/// Network limits shared by tracker and storage connections.
#[derive(Debug, Clone, Copy)]
pub struct FdfsTimeouts {
    pub connect: Duration,
    pub socket: Duration,
}

impl Default for FdfsTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(600),
            socket: Duration::from_millis(1500),
        }
    }
}

/// Replies shorter than this are never valid, so a hard cap on the body
/// length guards against parsing a corrupt length field into a huge read.
const MAX_BODY_LEN: u64 = 1 << 31;

async fn open(endpoint: &str, timeouts: FdfsTimeouts) -> StoreResult<TcpStream> {
    timeout(timeouts.connect, TcpStream::connect(endpoint))
        .await
        .map_err(|_| StoreError::Connection(format!("connect to {endpoint} timed out")))?
        .map_err(|err| StoreError::Connection(format!("connect to {endpoint} failed: {err}")))
}

async fn send_request(
    stream: &mut TcpStream,
    cmd: u8,
    body: &[u8],
    timeouts: FdfsTimeouts,
) -> StoreResult<()> {
    let header = Header::request(cmd, body.len() as u64);
    let io = async {
        stream.write_all(&header.encode()).await?;
        stream.write_all(body).await?;
        stream.flush().await
    };
    timeout(timeouts.socket, io)
        .await
        .map_err(|_| StoreError::Connection("request write timed out".into()))?
        .map_err(|err| StoreError::Connection(format!("request write failed: {err}")))
}

/// Read one response frame. A nonzero status is the server-side errno;
/// ENOENT surfaces as `Ok(None)` so callers can treat absence as a state,
/// not a fault.
async fn read_response(
    stream: &mut TcpStream,
    timeouts: FdfsTimeouts,
) -> StoreResult<Option<Vec<u8>>> {
    let mut header_buf = [0u8; HEADER_LEN];
    timeout(timeouts.socket, stream.read_exact(&mut header_buf))
        .await
        .map_err(|_| StoreError::Connection("response read timed out".into()))?
        .map_err(|err| StoreError::Connection(format!("response read failed: {err}")))?;
    let header = Header::decode(&header_buf);

    match header.status {
        STATUS_OK => {}
        STATUS_NOT_FOUND => return Ok(None),
        errno => {
            return Err(StoreError::Protocol(format!(
                "server returned status {errno} for command {}",
                header.cmd
            )))
        }
    }
    if header.body_len > MAX_BODY_LEN {
        return Err(StoreError::Protocol(format!(
            "implausible body length {}",
            header.body_len
        )));
    }

    let mut body = vec![0u8; header.body_len as usize];
    timeout(timeouts.socket, stream.read_exact(&mut body))
        .await
        .map_err(|_| StoreError::Connection("response body read timed out".into()))?
        .map_err(|err| StoreError::Connection(format!("response body read failed: {err}")))?;
    Ok(Some(body))
}

async fn roundtrip(
    endpoint: &str,
    cmd: u8,
    body: &[u8],
    timeouts: FdfsTimeouts,
) -> StoreResult<Option<Vec<u8>>> {
    let mut stream = open(endpoint, timeouts).await?;
    send_request(&mut stream, cmd, body, timeouts).await?;
    read_response(&mut stream, timeouts).await
}

/// Client for the tracker cluster. Queries walk the tracker list in order
/// and use the first tracker that answers.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    trackers: Vec<String>,
    timeouts: FdfsTimeouts,
}

impl TrackerClient {
    pub fn new(trackers: Vec<String>, timeouts: FdfsTimeouts) -> Self {
        Self { trackers, timeouts }
    }

    async fn query(&self, cmd: u8, body: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let mut last_err = StoreError::Connection("tracker list is empty".into());
        for endpoint in &self.trackers {
            match roundtrip(endpoint, cmd, body, self.timeouts).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_transient() => {
                    tracing::debug!(target = "polystore", tracker = %endpoint, %err, "tracker unreachable, trying next");
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Ask for a storage server to upload to, optionally pinned to a group.
    pub async fn query_store(&self, group: Option<&str>) -> StoreResult<StorageNode> {
        let (cmd, body) = match group {
            Some(group) => (proto::TRACKER_QUERY_STORE_WITH_GROUP, proto::store_query_body(group)),
            None => (proto::TRACKER_QUERY_STORE_WITHOUT_GROUP, Vec::new()),
        };
        let body = self
            .query(cmd, &body)
            .await?
            .ok_or_else(|| StoreError::Protocol("tracker has no writable storage".into()))?;
        StorageNode::parse_store(&body)
    }

    /// Ask which storage server holds an existing file.
    pub async fn query_fetch(&self, group: &str, filename: &str) -> StoreResult<Option<StorageNode>> {
        let body = proto::group_and_filename_body(group, filename);
        match self.query(proto::TRACKER_QUERY_FETCH, &body).await? {
            Some(body) => StorageNode::parse_fetch(&body).map(Some),
            None => Ok(None),
        }
    }

    /// Ask which storage server may modify an existing file.
    pub async fn query_update(&self, group: &str, filename: &str) -> StoreResult<Option<StorageNode>> {
        let body = proto::group_and_filename_body(group, filename);
        match self.query(proto::TRACKER_QUERY_UPDATE, &body).await? {
            Some(body) => StorageNode::parse_fetch(&body).map(Some),
            None => Ok(None),
        }
    }

    pub async fn list_groups(&self) -> StoreResult<Vec<GroupStat>> {
        let body = self
            .query(proto::TRACKER_LIST_GROUPS, &[])
            .await?
            .unwrap_or_default();
        GroupStat::parse_list(&body)
    }
}

/// Client for one storage server, addressed per operation.
#[derive(Debug, Clone, Copy)]
pub struct StorageClient {
    timeouts: FdfsTimeouts,
}

impl StorageClient {
    pub fn new(timeouts: FdfsTimeouts) -> Self {
        Self { timeouts }
    }

    /// Upload a whole file, returning the location the server chose.
    /// `appender` selects the appendable file type needed for later
    /// `append` calls.
    pub async fn upload(
        &self,
        node: &StorageNode,
        ext: &str,
        data: &[u8],
        appender: bool,
    ) -> StoreResult<StorePath> {
        let cmd = if appender {
            proto::STORAGE_UPLOAD_APPENDER_FILE
        } else {
            proto::STORAGE_UPLOAD_FILE
        };
        let body = proto::upload_body(node.store_path_index, ext, data);
        let resp = roundtrip(&node.endpoint(), cmd, &body, self.timeouts)
            .await?
            .ok_or_else(|| StoreError::Protocol("upload rejected by storage server".into()))?;
        StorePath::parse(&resp)
    }

    pub async fn download(
        &self,
        node: &StorageNode,
        group: &str,
        filename: &str,
    ) -> StoreResult<Option<Vec<u8>>> {
        let body = proto::download_body(group, filename, 0, 0);
        roundtrip(&node.endpoint(), proto::STORAGE_DOWNLOAD_FILE, &body, self.timeouts).await
    }

    /// Returns whether the file existed.
    pub async fn delete(&self, node: &StorageNode, group: &str, filename: &str) -> StoreResult<bool> {
        let body = proto::group_and_filename_body(group, filename);
        let resp =
            roundtrip(&node.endpoint(), proto::STORAGE_DELETE_FILE, &body, self.timeouts).await?;
        Ok(resp.is_some())
    }

    pub async fn query_file_info(
        &self,
        node: &StorageNode,
        group: &str,
        filename: &str,
    ) -> StoreResult<Option<RemoteFileInfo>> {
        let body = proto::group_and_filename_body(group, filename);
        match roundtrip(&node.endpoint(), proto::STORAGE_QUERY_FILE_INFO, &body, self.timeouts)
            .await?
        {
            Some(body) => RemoteFileInfo::parse(&body).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set_metadata(
        &self,
        node: &StorageNode,
        group: &str,
        filename: &str,
        metadata: &BTreeMap<String, String>,
        merge: bool,
    ) -> StoreResult<()> {
        let op = if merge {
            proto::METADATA_MERGE
        } else {
            proto::METADATA_OVERWRITE
        };
        let body = proto::set_metadata_body(group, filename, metadata, op);
        roundtrip(&node.endpoint(), proto::STORAGE_SET_METADATA, &body, self.timeouts)
            .await?
            .map(|_| ())
            .ok_or_else(|| StoreError::Protocol(format!("no such file to tag: {group}/{filename}")))
    }

    pub async fn append(
        &self,
        node: &StorageNode,
        filename: &str,
        data: &[u8],
    ) -> StoreResult<()> {
        let body = proto::append_body(filename, data);
        roundtrip(&node.endpoint(), proto::STORAGE_APPEND_FILE, &body, self.timeouts)
            .await?
            .map(|_| ())
            .ok_or_else(|| StoreError::Protocol(format!("no such appender file: {filename}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_server(responses: Vec<(u8, u8, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            for (expect_cmd, status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut header = [0u8; HEADER_LEN];
                socket.read_exact(&mut header).await.unwrap();
                let req = Header::decode(&header);
                assert_eq!(req.cmd, expect_cmd);
                let mut req_body = vec![0u8; req.body_len as usize];
                socket.read_exact(&mut req_body).await.unwrap();
                let resp = Header {
                    body_len: body.len() as u64,
                    cmd: proto::RESP_CMD,
                    status,
                };
                socket.write_all(&resp.encode()).await.unwrap();
                socket.write_all(&body).await.unwrap();
            }
        });
        addr
    }

    fn store_node_body() -> Vec<u8> {
        let mut body = vec![0u8; 40];
        body[..6].copy_from_slice(b"group1");
        body[16..16 + 9].copy_from_slice(b"127.0.0.1");
        body[31..39].copy_from_slice(&23000u64.to_be_bytes());
        body
    }

    #[tokio::test]
    async fn query_store_parses_tracker_reply() {
        let addr =
            fake_server(vec![(proto::TRACKER_QUERY_STORE_WITHOUT_GROUP, STATUS_OK, store_node_body())])
                .await;
        let tracker = TrackerClient::new(vec![addr], FdfsTimeouts::default());
        let node = tracker.query_store(None).await.unwrap();
        assert_eq!(node.group, "group1");
        assert_eq!(node.port, 23000);
    }

    #[tokio::test]
    async fn unreachable_tracker_falls_through_to_next() {
        let good =
            fake_server(vec![(proto::TRACKER_QUERY_STORE_WITH_GROUP, STATUS_OK, store_node_body())])
                .await;
        let tracker = TrackerClient::new(
            vec!["127.0.0.1:1".to_string(), good],
            FdfsTimeouts::default(),
        );
        let node = tracker.query_store(Some("group1")).await.unwrap();
        assert_eq!(node.group, "group1");
    }

    #[tokio::test]
    async fn all_trackers_down_is_a_transient_error() {
        let tracker = TrackerClient::new(
            vec!["127.0.0.1:1".to_string()],
            FdfsTimeouts {
                connect: Duration::from_millis(200),
                socket: Duration::from_millis(200),
            },
        );
        let err = tracker.query_store(None).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn enoent_status_maps_to_absence() {
        let addr = fake_server(vec![(proto::TRACKER_QUERY_FETCH, STATUS_NOT_FOUND, Vec::new())]).await;
        let tracker = TrackerClient::new(vec![addr], FdfsTimeouts::default());
        let node = tracker.query_fetch("group1", "M00/missing.bin").await.unwrap();
        assert!(node.is_none());
    }

    #[tokio::test]
    async fn other_errno_is_a_protocol_error() {
        let addr = fake_server(vec![(proto::TRACKER_QUERY_FETCH, 13, Vec::new())]).await;
        let tracker = TrackerClient::new(vec![addr], FdfsTimeouts::default());
        let err = tracker.query_fetch("group1", "f").await.unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn upload_round_trips_store_path() {
        let mut resp = vec![0u8; proto::GROUP_NAME_LEN];
        resp[..6].copy_from_slice(b"group1");
        resp.extend_from_slice(b"M00/00/00/abc.png");
        let addr = fake_server(vec![(proto::STORAGE_UPLOAD_APPENDER_FILE, STATUS_OK, resp)]).await;
        let (ip, port) = addr.rsplit_once(':').unwrap();
        let node = StorageNode {
            group: "group1".into(),
            ip: ip.to_string(),
            port: port.parse().unwrap(),
            store_path_index: 0,
        };
        let storage = StorageClient::new(FdfsTimeouts::default());
        let path = storage.upload(&node, "png", b"data", true).await.unwrap();
        assert_eq!(path.group, "group1");
        assert_eq!(path.filename, "M00/00/00/abc.png");
    }

    #[tokio::test]
    async fn delete_reports_whether_the_file_existed() {
        let addr = fake_server(vec![
            (proto::STORAGE_DELETE_FILE, STATUS_OK, Vec::new()),
            (proto::STORAGE_DELETE_FILE, STATUS_NOT_FOUND, Vec::new()),
        ])
        .await;
        let (ip, port) = addr.rsplit_once(':').unwrap();
        let node = StorageNode {
            group: "group1".into(),
            ip: ip.to_string(),
            port: port.parse().unwrap(),
            store_path_index: 0,
        };
        let storage = StorageClient::new(FdfsTimeouts::default());
        assert!(storage.delete(&node, "group1", "M00/a.bin").await.unwrap());
        assert!(!storage.delete(&node, "group1", "M00/a.bin").await.unwrap());
    }

    #[tokio::test]
    async fn append_targets_an_existing_appender_file() {
        let addr = fake_server(vec![
            (proto::STORAGE_APPEND_FILE, STATUS_OK, Vec::new()),
            (proto::STORAGE_APPEND_FILE, STATUS_NOT_FOUND, Vec::new()),
        ])
        .await;
        let (ip, port) = addr.rsplit_once(':').unwrap();
        let node = StorageNode {
            group: "group1".into(),
            ip: ip.to_string(),
            port: port.parse().unwrap(),
            store_path_index: 0,
        };
        let storage = StorageClient::new(FdfsTimeouts::default());
        storage.append(&node, "M00/big.bin", b"more").await.unwrap();
        let err = storage.append(&node, "M00/gone.bin", b"more").await.unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }
}
