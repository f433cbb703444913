//! FastDFS wire format: fixed 10-byte headers followed by command-specific
//! binary bodies. Integers are big-endian; fixed-width text fields are
//! NUL-padded ASCII.

use std::collections::BTreeMap;

use crate::error::{StoreError, StoreResult};

pub const HEADER_LEN: usize = 10;
pub const GROUP_NAME_LEN: usize = 16;
pub const IP_ADDRESS_LEN: usize = 15;
pub const EXT_NAME_LEN: usize = 6;
pub const GROUP_STAT_LEN: usize = 105;

// Tracker commands.
pub const TRACKER_LIST_GROUPS: u8 = 91;
pub const TRACKER_QUERY_STORE_WITHOUT_GROUP: u8 = 101;
pub const TRACKER_QUERY_FETCH: u8 = 102;
pub const TRACKER_QUERY_UPDATE: u8 = 103;
pub const TRACKER_QUERY_STORE_WITH_GROUP: u8 = 104;

// Storage commands.
pub const STORAGE_UPLOAD_FILE: u8 = 11;
pub const STORAGE_DELETE_FILE: u8 = 12;
pub const STORAGE_SET_METADATA: u8 = 13;
pub const STORAGE_DOWNLOAD_FILE: u8 = 14;
pub const STORAGE_QUERY_FILE_INFO: u8 = 22;
pub const STORAGE_UPLOAD_APPENDER_FILE: u8 = 23;
pub const STORAGE_APPEND_FILE: u8 = 24;

pub const RESP_CMD: u8 = 100;

/// Status byte carrying a Unix errno; 2 is ENOENT.
pub const STATUS_OK: u8 = 0;
pub const STATUS_NOT_FOUND: u8 = 2;

pub const METADATA_OVERWRITE: u8 = b'O';
pub const METADATA_MERGE: u8 = b'M';

const RECORD_SEP: char = '\u{01}';
const FIELD_SEP: char = '\u{02}';

/// Packet header preceding every request and response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub body_len: u64,
    pub cmd: u8,
    pub status: u8,
}

impl Header {
    pub fn request(cmd: u8, body_len: u64) -> Self {
        Self {
            body_len,
            cmd,
            status: STATUS_OK,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..8].copy_from_slice(&self.body_len.to_be_bytes());
        buf[8] = self.cmd;
        buf[9] = self.status;
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[..8]);
        Self {
            body_len: u64::from_be_bytes(len),
            cmd: buf[8],
            status: buf[9],
        }
    }
}

/// Storage server address handed out by a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageNode {
    pub group: String,
    pub ip: String,
    pub port: u16,
    pub store_path_index: u8,
}

impl StorageNode {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Parse the 40-byte store-query response (group, ip, port, path index).
    pub fn parse_store(body: &[u8]) -> StoreResult<Self> {
        if body.len() < GROUP_NAME_LEN + IP_ADDRESS_LEN + 8 + 1 {
            return Err(StoreError::Protocol(format!(
                "short tracker store response: {} bytes",
                body.len()
            )));
        }
        let (group, ip, port) = parse_node_fields(body)?;
        Ok(Self {
            group,
            ip,
            port,
            store_path_index: body[GROUP_NAME_LEN + IP_ADDRESS_LEN + 8],
        })
    }

    /// Parse the 39-byte fetch/update response (no path index).
    pub fn parse_fetch(body: &[u8]) -> StoreResult<Self> {
        if body.len() < GROUP_NAME_LEN + IP_ADDRESS_LEN + 8 {
            return Err(StoreError::Protocol(format!(
                "short tracker fetch response: {} bytes",
                body.len()
            )));
        }
        let (group, ip, port) = parse_node_fields(body)?;
        Ok(Self {
            group,
            ip,
            port,
            store_path_index: 0,
        })
    }
}

fn parse_node_fields(body: &[u8]) -> StoreResult<(String, String, u16)> {
    let group = fixed_str(&body[..GROUP_NAME_LEN]);
    let ip = fixed_str(&body[GROUP_NAME_LEN..GROUP_NAME_LEN + IP_ADDRESS_LEN]);
    let mut port_buf = [0u8; 8];
    port_buf.copy_from_slice(&body[GROUP_NAME_LEN + IP_ADDRESS_LEN..GROUP_NAME_LEN + IP_ADDRESS_LEN + 8]);
    let port = u64::from_be_bytes(port_buf);
    let port = u16::try_from(port)
        .map_err(|_| StoreError::Protocol(format!("storage port out of range: {port}")))?;
    Ok((group, ip, port))
}

/// Remote location of a stored file: group name plus the filename the
/// storage server assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePath {
    pub group: String,
    pub filename: String,
}

impl StorePath {
    pub fn parse(body: &[u8]) -> StoreResult<Self> {
        if body.len() <= GROUP_NAME_LEN {
            return Err(StoreError::Protocol(format!(
                "short upload response: {} bytes",
                body.len()
            )));
        }
        Ok(Self {
            group: fixed_str(&body[..GROUP_NAME_LEN]),
            filename: string_from_bytes(&body[GROUP_NAME_LEN..])?,
        })
    }
}

/// Per-group statistics from the tracker's group listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStat {
    pub name: String,
    pub total_mb: u64,
    pub free_mb: u64,
    pub trunk_free_mb: u64,
    pub server_count: u64,
    pub storage_port: u64,
    pub storage_http_port: u64,
    pub active_count: u64,
    pub current_write_server: u64,
    pub store_path_count: u64,
    pub subdir_count_per_path: u64,
    pub current_trunk_file_id: u64,
}

impl GroupStat {
    pub fn parse_list(body: &[u8]) -> StoreResult<Vec<Self>> {
        if body.len() % GROUP_STAT_LEN != 0 {
            return Err(StoreError::Protocol(format!(
                "group list body of {} bytes is not a multiple of {GROUP_STAT_LEN}",
                body.len()
            )));
        }
        body.chunks_exact(GROUP_STAT_LEN).map(Self::parse_one).collect()
    }

    fn parse_one(chunk: &[u8]) -> StoreResult<Self> {
        // 17-byte name field, then eleven 8-byte counters.
        let name = fixed_str(&chunk[..GROUP_NAME_LEN + 1]);
        let mut ints = [0u64; 11];
        for (i, slot) in ints.iter_mut().enumerate() {
            let start = GROUP_NAME_LEN + 1 + i * 8;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&chunk[start..start + 8]);
            *slot = u64::from_be_bytes(buf);
        }
        Ok(Self {
            name,
            total_mb: ints[0],
            free_mb: ints[1],
            trunk_free_mb: ints[2],
            server_count: ints[3],
            storage_port: ints[4],
            storage_http_port: ints[5],
            active_count: ints[6],
            current_write_server: ints[7],
            store_path_count: ints[8],
            subdir_count_per_path: ints[9],
            current_trunk_file_id: ints[10],
        })
    }
}

/// File facts from a storage query-file-info response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub size: u64,
    pub create_time: u64,
    pub crc32: u64,
}

impl RemoteFileInfo {
    pub fn parse(body: &[u8]) -> StoreResult<Self> {
        if body.len() < 24 {
            return Err(StoreError::Protocol(format!(
                "short file-info response: {} bytes",
                body.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&body[..8]);
        let size = u64::from_be_bytes(buf);
        buf.copy_from_slice(&body[8..16]);
        let create_time = u64::from_be_bytes(buf);
        buf.copy_from_slice(&body[16..24]);
        let crc32 = u64::from_be_bytes(buf);
        Ok(Self {
            size,
            create_time,
            crc32,
        })
    }
}

/// Body for the group-scoped tracker store query.
pub fn store_query_body(group: &str) -> Vec<u8> {
    let mut body = vec![0u8; GROUP_NAME_LEN];
    write_fixed_str(&mut body, group);
    body
}

/// Body shared by fetch/update tracker queries and the delete and
/// file-info storage commands: a group field followed by the filename.
pub fn group_and_filename_body(group: &str, filename: &str) -> Vec<u8> {
    let mut body = vec![0u8; GROUP_NAME_LEN];
    write_fixed_str(&mut body, group);
    body.extend_from_slice(filename.as_bytes());
    body
}

pub fn upload_body(store_path_index: u8, ext: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + 8 + EXT_NAME_LEN + data.len());
    body.push(store_path_index);
    body.extend_from_slice(&(data.len() as u64).to_be_bytes());
    let mut ext_field = vec![0u8; EXT_NAME_LEN];
    write_fixed_str(&mut ext_field, ext);
    body.extend_from_slice(&ext_field);
    body.extend_from_slice(data);
    body
}

pub fn download_body(group: &str, filename: &str, offset: u64, length: u64) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + GROUP_NAME_LEN + filename.len());
    body.extend_from_slice(&offset.to_be_bytes());
    body.extend_from_slice(&length.to_be_bytes());
    let mut group_field = vec![0u8; GROUP_NAME_LEN];
    write_fixed_str(&mut group_field, group);
    body.extend_from_slice(&group_field);
    body.extend_from_slice(filename.as_bytes());
    body
}

pub fn append_body(filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + filename.len() + data.len());
    body.extend_from_slice(&(filename.len() as u64).to_be_bytes());
    body.extend_from_slice(&(data.len() as u64).to_be_bytes());
    body.extend_from_slice(filename.as_bytes());
    body.extend_from_slice(data);
    body
}

pub fn set_metadata_body(
    group: &str,
    filename: &str,
    metadata: &BTreeMap<String, String>,
    op: u8,
) -> Vec<u8> {
    let meta = encode_metadata(metadata);
    let mut body = Vec::with_capacity(17 + GROUP_NAME_LEN + filename.len() + meta.len());
    body.extend_from_slice(&(filename.len() as u64).to_be_bytes());
    body.extend_from_slice(&(meta.len() as u64).to_be_bytes());
    body.push(op);
    let mut group_field = vec![0u8; GROUP_NAME_LEN];
    write_fixed_str(&mut group_field, group);
    body.extend_from_slice(&group_field);
    body.extend_from_slice(filename.as_bytes());
    body.extend_from_slice(meta.as_bytes());
    body
}

/// Metadata records are `key \x02 value` pairs joined by `\x01`.
pub fn encode_metadata(metadata: &BTreeMap<String, String>) -> String {
    metadata
        .iter()
        .map(|(k, v)| format!("{k}{FIELD_SEP}{v}"))
        .collect::<Vec<_>>()
        .join(&RECORD_SEP.to_string())
}

pub fn decode_metadata(raw: &str) -> BTreeMap<String, String> {
    raw.split(RECORD_SEP)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            record
                .split_once(FIELD_SEP)
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn write_fixed_str(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}

fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn string_from_bytes(bytes: &[u8]) -> StoreResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StoreError::Protocol("non-UTF-8 filename in response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header::request(STORAGE_UPLOAD_FILE, 1234);
        let decoded = Header::decode(&header.encode());
        assert_eq!(decoded, header);
        assert_eq!(decoded.body_len, 1234);
    }

    #[test]
    fn store_response_parses_node_and_path_index() {
        let mut body = vec![0u8; 40];
        body[..6].copy_from_slice(b"group1");
        body[16..16 + 9].copy_from_slice(b"10.0.0.12");
        body[31..39].copy_from_slice(&23000u64.to_be_bytes());
        body[39] = 3;
        let node = StorageNode::parse_store(&body).unwrap();
        assert_eq!(node.group, "group1");
        assert_eq!(node.ip, "10.0.0.12");
        assert_eq!(node.port, 23000);
        assert_eq!(node.store_path_index, 3);
        assert_eq!(node.endpoint(), "10.0.0.12:23000");
    }

    #[test]
    fn fetch_response_parses_without_path_index() {
        let mut body = vec![0u8; 39];
        body[..6].copy_from_slice(b"group2");
        body[16..16 + 7].copy_from_slice(b"1.2.3.4");
        body[31..39].copy_from_slice(&23001u64.to_be_bytes());
        let node = StorageNode::parse_fetch(&body).unwrap();
        assert_eq!(node.group, "group2");
        assert_eq!(node.port, 23001);
    }

    #[test]
    fn short_tracker_response_is_a_protocol_error() {
        assert!(matches!(
            StorageNode::parse_store(&[0u8; 10]),
            Err(StoreError::Protocol(_))
        ));
    }

    #[test]
    fn store_path_splits_group_and_filename() {
        let mut body = vec![0u8; GROUP_NAME_LEN];
        body[..6].copy_from_slice(b"group1");
        body.extend_from_slice(b"M00/00/1F/abc123.png");
        let path = StorePath::parse(&body).unwrap();
        assert_eq!(path.group, "group1");
        assert_eq!(path.filename, "M00/00/1F/abc123.png");
    }

    #[test]
    fn upload_body_layout() {
        let body = upload_body(2, "png", b"data");
        assert_eq!(body[0], 2);
        assert_eq!(body[1..9], 4u64.to_be_bytes());
        assert_eq!(&body[9..12], b"png");
        assert_eq!(body[12..15], [0, 0, 0]);
        assert_eq!(&body[15..], b"data");
    }

    #[test]
    fn download_body_layout() {
        let body = download_body("group1", "M00/a.bin", 8, 0);
        assert_eq!(body[..8], 8u64.to_be_bytes());
        assert_eq!(body[8..16], 0u64.to_be_bytes());
        assert_eq!(&body[16..22], b"group1");
        assert_eq!(&body[32..], b"M00/a.bin");
    }

    #[test]
    fn append_body_layout() {
        let body = append_body("f.bin", b"xy");
        assert_eq!(body[..8], 5u64.to_be_bytes());
        assert_eq!(body[8..16], 2u64.to_be_bytes());
        assert_eq!(&body[16..21], b"f.bin");
        assert_eq!(&body[21..], b"xy");
    }

    #[test]
    fn metadata_round_trips_through_separators() {
        let mut meta = BTreeMap::new();
        meta.insert("ext_name".to_string(), "png".to_string());
        meta.insert("file_size".to_string(), "42".to_string());
        let encoded = encode_metadata(&meta);
        assert_eq!(encoded, "ext_name\u{02}png\u{01}file_size\u{02}42");
        assert_eq!(decode_metadata(&encoded), meta);
    }

    #[test]
    fn group_stats_parse_in_105_byte_records() {
        let mut body = vec![0u8; GROUP_STAT_LEN * 2];
        body[..6].copy_from_slice(b"group1");
        body[17..25].copy_from_slice(&2048u64.to_be_bytes()); // total_mb
        body[25..33].copy_from_slice(&512u64.to_be_bytes()); // free_mb
        body[GROUP_STAT_LEN..GROUP_STAT_LEN + 6].copy_from_slice(b"group2");
        let stats = GroupStat::parse_list(&body).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "group1");
        assert_eq!(stats[0].total_mb, 2048);
        assert_eq!(stats[0].free_mb, 512);
        assert_eq!(stats[1].name, "group2");
    }

    #[test]
    fn misaligned_group_list_is_rejected() {
        assert!(GroupStat::parse_list(&[0u8; 100]).is_err());
    }

    #[test]
    fn file_info_parses_size_and_crc() {
        let mut body = vec![0u8; 40];
        body[..8].copy_from_slice(&9000u64.to_be_bytes());
        body[8..16].copy_from_slice(&1_700_000_000u64.to_be_bytes());
        body[16..24].copy_from_slice(&0xDEAD_BEEFu64.to_be_bytes());
        let info = RemoteFileInfo::parse(&body).unwrap();
        assert_eq!(info.size, 9000);
        assert_eq!(info.create_time, 1_700_000_000);
        assert_eq!(info.crc32, 0xDEAD_BEEF);
    }
}
