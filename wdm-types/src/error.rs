//! Error types for the WDM wire layer.

use thiserror::Error;

/// Errors that can occur while encoding or decoding WDM wire data.
#[derive(Debug, Error)]
pub enum WdmError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Unknown importance discriminator
    #[error("invalid importance: {0}")]
    InvalidImportance(u8),

    /// Invalid protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WdmError::InvalidImportance(9);
        assert_eq!(err.to_string(), "invalid importance: 9");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WdmError>();
    }
}
