/// K-IRC Crypto Library
///
/// - Identities are X25519 keypairs. The public half is exchanged out of band.
/// - `seal`/`open`: ephemeral-static X25519 + HKDF-SHA256 + AES-256-GCM, for
///   small payloads addressed to one identity (channel key updates, history
///   pages, direct messages).
/// - Channel keys: random AES-256-GCM keys shared by a channel's members,
///   distributed sealed and never sent in the clear.
pub mod encrypt;
pub mod error;
pub mod keys;
pub mod seal;

pub use encrypt::{decrypt_message, decrypt_text, encrypt_message, encrypt_text};
pub use error::CryptoError;
pub use keys::{ChannelKey, Identity, PublicKey};
pub use seal::{SEAL_MAX_PLAINTEXT, open, seal};
