//! Sealed boxes: anonymous, randomized public-key encryption.
//!
//! seal: ephemeral X25519 keypair, DH with the recipient's public key,
//!   HKDF-SHA256(salt = eph_pub || recipient_pub, info = "kirc-seal-v1")
//!   → 32-byte AES-256-GCM key, AAD = eph_pub.
//!
//! Wire format: version(1) + eph_pub(32) + nonce(12) + ciphertext + tag(16)

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::encrypt::{NONCE_SIZE, TAG_SIZE};
use crate::error::CryptoError;
use crate::keys::{Identity, KEY_SIZE};

/// Largest plaintext `seal` accepts. Bigger payloads must be compacted (or
/// trimmed) by the caller before sealing.
pub const SEAL_MAX_PLAINTEXT: usize = 16 * 1024;

const VERSION: u8 = 1;
const HEADER: usize = 1 + KEY_SIZE + NONCE_SIZE;
const INFO: &[u8] = b"kirc-seal-v1";

fn derive_cipher(
    shared: &[u8; KEY_SIZE],
    eph_pub: &PublicKey,
    recipient: &PublicKey,
) -> Result<Aes256Gcm, CryptoError> {
    let mut salt = [0u8; 2 * KEY_SIZE];
    salt[..KEY_SIZE].copy_from_slice(eph_pub.as_bytes());
    salt[KEY_SIZE..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; KEY_SIZE];
    hk.expand(INFO, &mut key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| CryptoError::InvalidKey(e.to_string()));
    key.fill(0);
    cipher
}

/// Seal `plaintext` so only the holder of `recipient`'s secret can open it.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() > SEAL_MAX_PLAINTEXT {
        return Err(CryptoError::PayloadTooLarge {
            len: plaintext.len(),
            max: SEAL_MAX_PLAINTEXT,
        });
    }

    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = PublicKey::from(&eph_secret);
    let shared = eph_secret.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order public key".into()));
    }

    let cipher = derive_cipher(shared.as_bytes(), &eph_pub, recipient)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: eph_pub.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER + ciphertext.len());
    out.push(VERSION);
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed box with the node's identity.
pub fn open(identity: &Identity, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < HEADER + TAG_SIZE {
        return Err(CryptoError::Decryption(format!(
            "sealed box too short: {} bytes",
            data.len()
        )));
    }
    if data[0] != VERSION {
        return Err(CryptoError::Decryption(format!(
            "unsupported sealed box version {}",
            data[0]
        )));
    }

    let mut eph_bytes = [0u8; KEY_SIZE];
    eph_bytes.copy_from_slice(&data[1..1 + KEY_SIZE]);
    let eph_pub = PublicKey::from(eph_bytes);
    let nonce = Nonce::from_slice(&data[1 + KEY_SIZE..HEADER]);

    let shared = identity.secret().diffie_hellman(&eph_pub);
    if !shared.was_contributory() {
        return Err(CryptoError::Decryption("low-order ephemeral key".into()));
    }

    let cipher = derive_cipher(shared.as_bytes(), &eph_pub, identity.public_key())?;
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &data[HEADER..],
                aad: eph_pub.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Decryption("key mismatch or corrupt sealed box".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip_up_to_the_bound() {
        let identity = Identity::generate();
        for len in [0, 1, 190, 4096, SEAL_MAX_PLAINTEXT] {
            let message: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = seal(identity.public_key(), &message).unwrap();
            assert_eq!(open(&identity, &sealed).unwrap(), message);
        }
    }

    #[test]
    fn sealing_is_randomized() {
        let identity = Identity::generate();
        let a = seal(identity.public_key(), b"channel key").unwrap();
        let b = seal(identity.public_key(), b"channel key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn oversized_plaintext_rejected() {
        let identity = Identity::generate();
        let message = vec![0u8; SEAL_MAX_PLAINTEXT + 1];
        assert_eq!(
            seal(identity.public_key(), &message),
            Err(CryptoError::PayloadTooLarge {
                len: SEAL_MAX_PLAINTEXT + 1,
                max: SEAL_MAX_PLAINTEXT,
            })
        );
    }

    #[test]
    fn wrong_identity_cannot_open() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let sealed = seal(alice.public_key(), b"for alice only").unwrap();
        assert!(matches!(open(&mallory, &sealed), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn corrupt_boxes_fail_cleanly() {
        let alice = Identity::generate();
        let mut sealed = seal(alice.public_key(), b"payload").unwrap();

        assert!(open(&alice, &sealed[..10]).is_err());

        sealed[HEADER] ^= 0xff;
        assert!(matches!(open(&alice, &sealed), Err(CryptoError::Decryption(_))));

        sealed[0] = 9;
        assert!(open(&alice, &sealed).is_err());
    }
}
