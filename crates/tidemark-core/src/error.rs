//! Core error types.

use thiserror::Error;

/// Storage-layer errors raised by the persistent history store.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying sled error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Failed to encode a ledger row.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failed to decode a ledger row.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A stored key did not have the expected layout.
    #[error("invalid key format")]
    InvalidKey,

    /// A stored value is structurally valid but semantically wrong.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The ledger lock could not be acquired in time.
    #[error("timed out after {waited_ms} ms waiting for the schema history lock")]
    LockTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::InvalidKey.to_string(), "invalid key format");
        assert_eq!(
            Error::LockTimeout { waited_ms: 1500 }.to_string(),
            "timed out after 1500 ms waiting for the schema history lock"
        );
    }
}
