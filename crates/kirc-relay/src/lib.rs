//! Channel relay protocol: per-channel leader leases, leader fan-out over
//! mailboxes, channel key lifecycle and history sync.

pub mod config;
pub mod history;
pub mod keys;
pub mod leader;
pub mod relay;
mod store;

pub use config::{KeyFallback, RelayConfig};
pub use keys::{KeyManager, KeyResolution, Keyring, RotationReport};
pub use leader::LeaderView;
pub use relay::{LOCKED_PLACEHOLDER, Relay};
