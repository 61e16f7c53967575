#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use kirc_coord::LocalStore;
use kirc_crypto::Identity;
use kirc_db::Database;
use kirc_mailbox::LocalBroker;
use kirc_relay::{Relay, RelayConfig};
use kirc_types::events::RelayEvent;
use kirc_types::models::Contact;

/// Shared backing services for a handful of in-process nodes.
pub struct Network {
    pub store: LocalStore,
    pub broker: LocalBroker,
}

impl Network {
    pub fn new() -> Self {
        Self {
            store: LocalStore::new(),
            broker: LocalBroker::new(),
        }
    }

    pub fn node(&self, name: &str) -> Relay {
        self.node_with(name, quiet_config())
    }

    pub fn node_with(&self, name: &str, config: RelayConfig) -> Relay {
        Relay::new(
            name,
            Identity::generate(),
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(self.store.clone()),
            Arc::new(self.broker.clone()),
            config,
        )
    }
}

/// Heartbeats far apart so tests drive them by hand.
pub fn quiet_config() -> RelayConfig {
    RelayConfig {
        heartbeat_interval: Duration::from_secs(3600),
        rpc_timeout: Duration::from_secs(2),
        ..RelayConfig::default()
    }
}

/// Record `peer`'s public key in `node`'s contacts.
pub async fn trust(node: &Relay, peer: &Relay) {
    node.save_contact(Contact::new(peer.username(), "local").with_public_key(peer.public_key_base64()))
        .await
        .unwrap();
}

/// Wait for the first event matching `pred`.
pub async fn expect_event<F>(rx: &mut broadcast::Receiver<RelayEvent>, pred: F) -> RelayEvent
where
    F: Fn(&RelayEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `cond` until it holds.
pub async fn eventually<F>(cond: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held")
}

pub fn is_rendered(content: &'static str) -> impl Fn(&RelayEvent) -> bool {
    move |event| matches!(event, RelayEvent::MessageRendered(msg) if msg.content == content)
}
