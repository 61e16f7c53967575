use std::sync::Arc;

use async_trait::async_trait;

use kirc_types::Result;

/// One entry of a topic's log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    /// Position within the topic, starting at zero
    pub offset: u64,
    /// Partitioning key (channel or sender)
    pub key: Option<String>,
    pub value: Vec<u8>,
}

/// The shared log-based broker. Topics are created on first produce or
/// subscribe.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Append a record and return its offset.
    async fn produce(&self, topic: &str, key: Option<&str>, value: Vec<u8>) -> Result<u64>;

    /// Open a consumer on `topics`. Every topic starts at its current end,
    /// so only records produced afterwards are delivered.
    async fn consumer(&self, topics: &[String]) -> Result<Arc<dyn Consumer>>;
}

/// A live consumer. Subscriptions may change while another task is waiting
/// in `recv`.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Add a topic, starting at its end. A topic already subscribed keeps
    /// its read position.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Remove a topic without touching the other positions.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Next record on any subscribed topic; `None` once closed.
    async fn recv(&self) -> Option<Record>;

    async fn close(&self);
}
