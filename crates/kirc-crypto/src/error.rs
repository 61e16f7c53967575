use kirc_types::KircError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Wrong private key, corrupt framing or a tampered sealed box
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Symmetric tag mismatch: wrong channel key or tampered ciphertext
    #[error("authentication tag mismatch")]
    Authentication,

    #[error("plaintext of {len} bytes exceeds the {max} byte seal limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),
}

impl From<CryptoError> for KircError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Decryption(reason) => KircError::Decryption(reason),
            CryptoError::Authentication => {
                KircError::Authentication("authentication tag mismatch".into())
            }
            CryptoError::PayloadTooLarge { len, max } => KircError::PayloadTooLarge { len, max },
            CryptoError::InvalidKey(reason) => KircError::Malformed(reason),
            CryptoError::Encryption(reason) => KircError::Crypto(reason),
        }
    }
}
