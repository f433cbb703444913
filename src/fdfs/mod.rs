//! FastDFS tracker/storage protocol support.
//!
//! No maintained Rust client for FastDFS exists, so the connector speaks
//! the binary protocol directly: [`proto`] holds the frame codec and
//! [`client`] the tracker and storage round-trips.

pub mod client;
pub mod proto;

pub use client::{FdfsTimeouts, StorageClient, TrackerClient};
pub use proto::{GroupStat, RemoteFileInfo, StorageNode, StorePath};
