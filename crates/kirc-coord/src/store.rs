use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kirc_types::Result;

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// The shared key-value + pub/sub service. Every call is a network round
/// trip; implementations report unreachability as `KircError::Connection`
/// and never retry.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Atomic set-if-absent with a TTL. Returns true if the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns true if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Reset a key's TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically reset the TTL only if the key currently holds `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Atomically delete only if the key currently holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>>;

    /// Live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Publish to a pub/sub channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize>;

    /// Open a new pub/sub connection with an empty subscription set.
    async fn subscriber(&self) -> Result<Arc<dyn Subscriber>>;
}

/// One pub/sub connection. Subscriptions may change while another task is
/// waiting in `next_message`.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<()>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Next message on any subscribed channel; `None` once closed.
    async fn next_message(&self) -> Option<PubSubMessage>;

    async fn close(&self);
}
