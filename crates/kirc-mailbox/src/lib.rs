//! Mailbox transport: per-identity inbox, outbox and RPC addresses over a
//! shared append-only log broker, with dynamic outbox subscriptions and RPC
//! request/response correlation.

pub mod broker;
pub mod kafka;
pub mod memory;
pub mod transport;

pub use broker::{Broker, Consumer, Record};
pub use kafka::{KafkaBroker, KafkaSettings};
pub use memory::LocalBroker;
pub use transport::{MailboxTransport, MessageHandler};
