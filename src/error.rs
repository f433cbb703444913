use thiserror::Error;

/// Failure taxonomy shared by every connector.
///
/// Only [`StoreError::Configuration`] ever crosses the public boundary as a
/// `Result` error (profile validation is the sole fatal path). Everything
/// else is normalized by the connectors to a `false` / `None` return plus a
/// diagnostic log entry. [`StoreError::Connection`] is the only kind the
/// retry machinery acts on.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Structurally invalid profile or options; raised during validation,
    /// prevents connector construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Transient network/session failure; drives reconnect-and-retry.
    #[error("connection failure: {0}")]
    Connection(String),

    /// The backend rejected the operation (address not found, permission
    /// denied, unsupported call). Not retried.
    #[error("backend rejected operation: {0}")]
    Protocol(String),

    /// Malformed path/address/payload input. Not retried.
    #[error("malformed input: {0}")]
    Format(String),
}

impl StoreError {
    /// Whether the retry/reconnect machinery should take another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
