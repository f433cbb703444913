//! Profile-to-connector resolution.
//!
//! A static table of constructor functions stands in for any dynamic
//! dispatch: callers may register overrides per backend tag, and
//! anything not overridden falls through to the built-in mapping for
//! the well-known tags.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connector::Connector;
use crate::error::{StoreError, StoreResult};
use crate::profile::ConnectionProfile;

/// Constructor signature all registered backends share.
pub type ConnectorConstructor = fn(ConnectionProfile) -> StoreResult<Arc<dyn Connector>>;

#[derive(Default)]
pub struct ConnectorFactory {
    overrides: HashMap<String, ConnectorConstructor>,
}

impl ConnectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `tag` to a custom constructor. Overrides are consulted
    /// before the built-in mapping, so a registered tag shadows it.
    pub fn register(&mut self, tag: impl Into<String>, constructor: ConnectorConstructor) {
        self.overrides.insert(tag.into().to_lowercase(), constructor);
    }

    /// Build a connector for the profile's backend tag. Tags are matched
    /// case-insensitively; an unknown tag is a configuration error.
    pub fn build(&self, profile: ConnectionProfile) -> StoreResult<Arc<dyn Connector>> {
        let tag = profile.kind.trim().to_lowercase();
        if let Some(constructor) = self.overrides.get(&tag) {
            return constructor(profile);
        }
        match tag.as_str() {
            #[cfg(feature = "ftp")]
            "ftp" => Ok(Arc::new(crate::connector::ftp::FtpConnector::new(profile)?)),
            #[cfg(feature = "sftp")]
            "sftp" => Ok(Arc::new(crate::connector::sftp::SftpConnector::new(
                profile,
            )?)),
            #[cfg(feature = "fdfs")]
            "fdfs" | "fastdfs" => Ok(Arc::new(crate::connector::fdfs::FdfsConnector::new(
                profile,
            )?)),
            #[cfg(feature = "minio")]
            "minio" => Ok(Arc::new(crate::connector::minio::MinioConnector::new(
                profile,
            )?)),
            other => Err(StoreError::Configuration(format!(
                "no connector registered for backend type {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::memory::MemoryConnector;

    fn memory_constructor(profile: ConnectionProfile) -> StoreResult<Arc<dyn Connector>> {
        let profile = profile.validate()?;
        Ok(Arc::new(MemoryConnector::new(profile.alias)))
    }

    fn profile(kind: &str) -> ConnectionProfile {
        ConnectionProfile::new(kind, "203.0.113.1", 2121)
            .with_credentials("user", "pw")
            .with_alias("test")
    }

    #[test]
    fn unknown_tag_is_a_configuration_error() {
        let factory = ConnectorFactory::new();
        assert!(matches!(
            factory.build(profile("webdav")),
            Err(StoreError::Configuration(_))
        ));
    }

    #[cfg(feature = "ftp")]
    #[test]
    fn builtin_tags_resolve_case_insensitively() {
        let factory = ConnectorFactory::new();
        let connector = factory.build(profile("FTP")).unwrap();
        assert_eq!(connector.kind(), "ftp");
    }

    #[cfg(feature = "fdfs")]
    #[test]
    fn fastdfs_is_an_alias_for_fdfs() {
        let factory = ConnectorFactory::new();
        assert_eq!(factory.build(profile("fdfs")).unwrap().kind(), "fdfs");
        assert_eq!(factory.build(profile("fastdfs")).unwrap().kind(), "fdfs");
    }

    #[test]
    fn override_shadows_the_builtin_mapping() {
        let mut factory = ConnectorFactory::new();
        factory.register("FTP", memory_constructor);
        let connector = factory.build(profile("ftp")).unwrap();
        assert_eq!(connector.kind(), "memory");
        assert_eq!(connector.alias(), "test");
    }

    #[test]
    fn override_constructor_errors_propagate() {
        let mut factory = ConnectorFactory::new();
        factory.register("mem", memory_constructor);
        let mut bad = profile("mem");
        bad.host = String::new();
        assert!(matches!(
            factory.build(bad),
            Err(StoreError::Configuration(_))
        ));
    }
}
