use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::error::CryptoError;
use crate::keys::ChannelKey;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Encrypt with AES-256-GCM under a fresh random nonce.
/// Wire format: nonce(12) + ciphertext + tag(16).
pub fn encrypt_message(key: &ChannelKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt output of `encrypt_message`. A wrong key or any tampering fails
/// with `CryptoError::Authentication`.
pub fn decrypt_message(key: &ChannelKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Authentication);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// Encrypt a text message into base64 for an envelope payload.
pub fn encrypt_text(key: &ChannelKey, text: &str) -> Result<String, CryptoError> {
    Ok(BASE64.encode(encrypt_message(key, text.as_bytes())?))
}

pub fn decrypt_text(key: &ChannelKey, encoded: &str) -> Result<String, CryptoError> {
    let data = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::Authentication)?;
    let plaintext = decrypt_message(key, &data)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Authentication)
}
