use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy shared by every layer of the relay node.
///
/// Connection and setup failures are returned to whoever started the
/// operation. Per-message failures (`Malformed`, `Decryption`,
/// `Authentication`) are logged by the consume loops and never stop them.
#[derive(Debug, Error)]
pub enum KircError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request {correlation_id} timed out after {elapsed:?}")]
    Timeout { correlation_id: Uuid, elapsed: Duration },

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption failed: {0}")]
    Crypto(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{user} is not allowed to {action}")]
    Authorization { user: String, action: String },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("not connected")]
    NotConnected,

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("no leader could be resolved for channel {0}")]
    NoLeader(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, KircError>;

impl KircError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    /// True for failures scoped to a single message.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::Decryption(_) | Self::Authentication(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_message_classification() {
        assert!(KircError::Malformed("bad".into()).is_per_message());
        assert!(KircError::Decryption("bad".into()).is_per_message());
        assert!(!KircError::NotConnected.is_per_message());
        assert!(!KircError::connection("refused").is_per_message());
    }
}
