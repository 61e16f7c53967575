use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};
use x25519_dalek::StaticSecret;

pub use x25519_dalek::PublicKey;

use crate::error::CryptoError;

pub const KEY_SIZE: usize = 32;

/// A 256-bit AES-256-GCM key shared by the members of one channel.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey([u8; KEY_SIZE]);

impl ChannelKey {
    /// Generate a fresh random channel key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len())))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

/// The node's long-lived keypair.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl Identity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore an identity from the base64 text written by `secret_to_base64`.
    pub fn from_secret_base64(encoded: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_secret_bytes(decode_key(encoded)?))
    }

    pub fn secret_to_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_key_base64(&self) -> String {
        public_key_to_base64(&self.public)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public)
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Encode a public key to base64 for display/sharing.
pub fn public_key_to_base64(key: &PublicKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Decode a contact's base64 public key.
pub fn public_key_from_base64(encoded: &str) -> Result<PublicKey, CryptoError> {
    Ok(PublicKey::from(decode_key(encoded)?))
}

/// Short hex digest of a public key, for logs and contact verification.
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_SIZE], CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("Invalid key length".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_keys_are_random() {
        assert_ne!(ChannelKey::generate(), ChannelKey::generate());
    }

    #[test]
    fn identity_base64_roundtrip() {
        let identity = Identity::generate();
        let restored = Identity::from_secret_base64(&identity.secret_to_base64()).unwrap();
        assert_eq!(restored.public_key(), identity.public_key());

        let public = public_key_from_base64(&identity.public_key_base64()).unwrap();
        assert_eq!(&public, identity.public_key());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            public_key_from_base64("AAAA"),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(ChannelKey::from_slice(&[0u8; 16]).is_err());
    }

    #[test]
    fn debug_never_prints_key_material() {
        let key = ChannelKey::generate();
        assert_eq!(format!("{:?}", key), "ChannelKey(..)");
        let identity = Identity::generate();
        assert!(!format!("{:?}", identity).contains(&identity.secret_to_base64()));
    }
}
