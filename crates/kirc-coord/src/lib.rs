//! Coordination client: leader leases, channel membership, presence, typing
//! and pub/sub signalling over a shared key-value + pub/sub store.

pub mod client;
pub mod memory;
pub mod store;
pub mod valkey;

pub use client::{CoordHandler, CoordinationClient};
pub use memory::LocalStore;
pub use store::{KeyValueStore, PubSubMessage, Subscriber};
pub use valkey::ValkeyStore;
