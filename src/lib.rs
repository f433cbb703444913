//! # polystore
//!
//! One storage interface over heterogeneous remote backends: FTP, SFTP,
//! a FastDFS-style distributed object store, and S3-compatible bucket
//! stores such as MinIO.
//!
//! Every backend implements the [`Connector`] trait: list, upload,
//! download, delete, create-directory, and resumable append operations
//! with uniform semantics. Failures never surface as backend errors;
//! operations report `false` or `None` and log the cause, so callers can
//! stay backend-agnostic. The only fallible step is profile validation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use polystore::{ConnectionProfile, ConnectorFactory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let profile = ConnectionProfile::new("sftp", "files.example.com", 22)
//!         .with_alias("archive")
//!         .with_credentials("deploy", "secret");
//!
//!     let factory = ConnectorFactory::new();
//!     let store = factory.build(profile)?;
//!
//!     store.upload(b"hello", "/drop/in", "greeting.txt").await;
//!     if let Some(entries) = store.list("/drop", true, false, -1).await {
//!         for entry in entries {
//!             println!("{}", entry.full_path());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Backend
//!
//! Implement [`Connector`] and register a constructor for its tag:
//!
//! ```rust
//! use polystore::{ConnectorFactory, MemoryConnector};
//! use std::sync::Arc;
//!
//! let mut factory = ConnectorFactory::new();
//! factory.register("mem", |profile| {
//!     let profile = profile.validate()?;
//!     Ok(Arc::new(MemoryConnector::new(profile.alias)))
//! });
//! ```

pub mod connector;
pub mod entry;
pub mod error;
pub mod factory;
#[cfg(feature = "fdfs")]
pub mod fdfs;
pub mod profile;
pub(crate) mod retry;
pub(crate) mod walk;

// Re-exports for convenience
pub use connector::memory::MemoryConnector;
pub use connector::{ByteStream, Connector, ResumeToken};
pub use entry::{FileEntry, NativeRecord};
pub use error::{StoreError, StoreResult};
pub use factory::{ConnectorConstructor, ConnectorFactory};
pub use profile::{ConnectionProfile, ExtensionOptions};

#[cfg(feature = "fdfs")]
pub use connector::fdfs::FdfsConnector;
#[cfg(feature = "ftp")]
pub use connector::ftp::FtpConnector;
#[cfg(feature = "minio")]
pub use connector::minio::MinioConnector;
#[cfg(feature = "sftp")]
pub use connector::sftp::SftpConnector;
