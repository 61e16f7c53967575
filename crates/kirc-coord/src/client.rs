use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use kirc_types::events::{
    CoordEvent, CoordEventKind, MembershipAction, MembershipEvent, Notification, PresenceEvent,
    RotationEvent, TypingEvent,
};
use kirc_types::handlers::HandlerTable;
use kirc_types::{KircError, Result, topics};

use crate::store::{KeyValueStore, PubSubMessage, Subscriber};

/// Typed callback for decoded coordination events.
#[async_trait]
pub trait CoordHandler: Send + Sync {
    async fn handle(&self, event: &CoordEvent) -> Result<()>;
}

/// Per-node view of the coordination store. Cheap to clone.
#[derive(Clone)]
pub struct CoordinationClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    store: Arc<dyn KeyValueStore>,
    username: String,
    subscriber: RwLock<Option<Arc<dyn Subscriber>>>,
    handlers: HandlerTable<CoordEventKind, dyn CoordHandler>,
    pubsub_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationClient {
    pub fn new(store: Arc<dyn KeyValueStore>, username: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                store,
                username: username.into(),
                subscriber: RwLock::new(None),
                handlers: HandlerTable::new(),
                pubsub_task: Mutex::new(None),
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// Open the pub/sub connection, subscribe to this node's notification
    /// stream and start the dispatch loop.
    pub async fn connect(&self) -> Result<()> {
        let subscriber = self.inner.store.subscriber().await?;
        subscriber.subscribe(&topics::notify(&self.inner.username)).await?;

        let task = tokio::spawn(run_pubsub_loop(
            subscriber.clone(),
            Arc::downgrade(&self.inner),
        ));

        *write_lock(&self.inner.subscriber) = Some(subscriber);
        if let Some(old) = lock(&self.inner.pubsub_task).replace(task) {
            old.abort();
        }

        info!("{} connected to coordination store", self.inner.username);
        Ok(())
    }

    /// Mark this node offline and stop the pub/sub loop.
    pub async fn disconnect(&self) {
        if let Err(e) = self.set_presence("offline", Duration::from_secs(300)).await {
            warn!("Could not publish offline presence: {}", e);
        }

        let subscriber = write_lock(&self.inner.subscriber).take();
        if let Some(subscriber) = subscriber {
            subscriber.close().await;
        }
        if let Some(task) = lock(&self.inner.pubsub_task).take() {
            task.abort();
        }

        info!("{} disconnected from coordination store", self.inner.username);
    }

    /// Register a handler for one kind of decoded event.
    pub fn on(&self, kind: CoordEventKind, handler: Arc<dyn CoordHandler>) {
        self.inner.handlers.register(kind, handler);
    }

    // -- Leader leases --

    /// Claim the channel's leader lease. When the lease already belongs to
    /// this node the TTL is renewed instead and the claim still succeeds.
    pub async fn claim_leader(&self, channel: &str, ttl: Duration) -> Result<bool> {
        let key = topics::leader_key(channel);
        let me = &self.inner.username;

        if self.inner.store.set_nx(&key, me, ttl).await? {
            info!("{} claimed leadership of {}", me, channel);
            return Ok(true);
        }

        if self.inner.store.expire_if_eq(&key, me, ttl).await? {
            trace!("{} renewed leadership of {}", me, channel);
            return Ok(true);
        }

        debug!("{} lost leader claim for {}", me, channel);
        Ok(false)
    }

    pub async fn get_leader(&self, channel: &str) -> Result<Option<String>> {
        self.inner.store.get(&topics::leader_key(channel)).await
    }

    /// Release the lease, but only if this node still owns it.
    pub async fn resign_leader(&self, channel: &str) -> Result<bool> {
        let resigned = self
            .inner
            .store
            .delete_if_eq(&topics::leader_key(channel), &self.inner.username)
            .await?;
        if resigned {
            info!("{} resigned leadership of {}", self.inner.username, channel);
        }
        Ok(resigned)
    }

    // -- Membership --

    pub async fn join(&self, channel: &str) -> Result<()> {
        self.inner
            .store
            .set_add(&topics::members_key(channel), &self.inner.username)
            .await?;
        self.publish_membership(channel, MembershipAction::Join).await
    }

    pub async fn leave(&self, channel: &str) -> Result<()> {
        self.inner
            .store
            .set_remove(&topics::members_key(channel), &self.inner.username)
            .await?;
        self.publish_membership(channel, MembershipAction::Leave).await
    }

    pub async fn members(&self, channel: &str) -> Result<BTreeSet<String>> {
        self.inner.store.set_members(&topics::members_key(channel)).await
    }

    async fn publish_membership(&self, channel: &str, action: MembershipAction) -> Result<()> {
        let event = MembershipEvent {
            channel: channel.to_string(),
            username: self.inner.username.clone(),
            action,
        };
        self.publish(&topics::channel_events(channel), &event).await
    }

    // -- Presence --

    pub async fn set_presence(&self, status: &str, ttl: Duration) -> Result<()> {
        let me = &self.inner.username;
        self.inner
            .store
            .set(&topics::presence(me), status, Some(ttl))
            .await?;

        let event = PresenceEvent {
            username: me.clone(),
            status: status.to_string(),
        };
        self.publish(&topics::presence(me), &event).await
    }

    /// Extend the presence TTL without publishing a change.
    pub async fn refresh_presence(&self, ttl: Duration) -> Result<bool> {
        self.inner
            .store
            .expire(&topics::presence(&self.inner.username), ttl)
            .await
    }

    /// A user's status, `"offline"` when absent or expired.
    pub async fn get_presence(&self, user: &str) -> Result<String> {
        Ok(self
            .inner
            .store
            .get(&topics::presence(user))
            .await?
            .unwrap_or_else(|| "offline".to_string()))
    }

    // -- Typing --

    pub async fn set_typing(&self, channel: &str, is_typing: bool, ttl: Duration) -> Result<()> {
        let key = topics::typing_key(channel, &self.inner.username);
        if is_typing {
            self.inner.store.set(&key, "1", Some(ttl)).await?;
        } else {
            self.inner.store.delete(&key).await?;
        }

        let event = TypingEvent {
            channel: channel.to_string(),
            username: self.inner.username.clone(),
            is_typing,
        };
        self.publish(&topics::typing(channel), &event).await
    }

    pub async fn get_typing_users(&self, channel: &str) -> Result<BTreeSet<String>> {
        let prefix = topics::typing_prefix(channel);
        let keys = self.inner.store.scan_prefix(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    // -- Signals --

    /// Announce a rotation. The key itself is never published.
    pub async fn publish_rotation(&self, channel: &str, key_id: &str) -> Result<()> {
        let event = RotationEvent {
            channel: channel.to_string(),
            key_id: key_id.to_string(),
        };
        self.publish(&topics::rotation(channel), &event).await
    }

    pub async fn send_notification(&self, recipient: &str, kind: &str, body: &str) -> Result<()> {
        let note = Notification {
            sender: self.inner.username.clone(),
            kind: kind.to_string(),
            body: body.to_string(),
        };
        self.publish(&topics::notify(recipient), &note).await
    }

    async fn publish<T: Serialize>(&self, channel: &str, event: &T) -> Result<()> {
        let payload =
            rmp_serde::to_vec_named(event).map_err(|e| KircError::Malformed(e.to_string()))?;
        self.inner.store.publish(channel, payload).await?;
        Ok(())
    }

    // -- Subscriptions --

    pub async fn subscribe_presence(&self, user: &str) -> Result<()> {
        self.subscribe_stream(&topics::presence(user)).await
    }

    pub async fn unsubscribe_presence(&self, user: &str) -> Result<()> {
        self.unsubscribe_stream(&topics::presence(user)).await
    }

    pub async fn subscribe_typing(&self, channel: &str) -> Result<()> {
        self.subscribe_stream(&topics::typing(channel)).await
    }

    pub async fn unsubscribe_typing(&self, channel: &str) -> Result<()> {
        self.unsubscribe_stream(&topics::typing(channel)).await
    }

    pub async fn subscribe_rotation(&self, channel: &str) -> Result<()> {
        self.subscribe_stream(&topics::rotation(channel)).await
    }

    pub async fn unsubscribe_rotation(&self, channel: &str) -> Result<()> {
        self.unsubscribe_stream(&topics::rotation(channel)).await
    }

    pub async fn subscribe_channel_events(&self, channel: &str) -> Result<()> {
        self.subscribe_stream(&topics::channel_events(channel)).await
    }

    pub async fn unsubscribe_channel_events(&self, channel: &str) -> Result<()> {
        self.unsubscribe_stream(&topics::channel_events(channel)).await
    }

    fn current_subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        read_lock(&self.inner.subscriber).clone()
    }

    async fn subscribe_stream(&self, name: &str) -> Result<()> {
        let subscriber = self.current_subscriber().ok_or(KircError::NotConnected)?;
        subscriber.subscribe(name).await
    }

    async fn unsubscribe_stream(&self, name: &str) -> Result<()> {
        match self.current_subscriber() {
            Some(subscriber) => subscriber.unsubscribe(name).await,
            None => Ok(()),
        }
    }
}

impl ClientInner {
    async fn dispatch(&self, event: CoordEvent) {
        for handler in self.handlers.handlers_for(event.kind()) {
            match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Coordination handler failed on {:?}: {}", event.kind(), e),
                Err(_) => error!("Coordination handler panicked on {:?}", event.kind()),
            }
        }
    }
}

async fn run_pubsub_loop(subscriber: Arc<dyn Subscriber>, inner: Weak<ClientInner>) {
    while let Some(msg) = subscriber.next_message().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match decode_event(&msg) {
            Ok(event) => inner.dispatch(event).await,
            Err(e) => warn!("Dropping pub/sub message on {}: {}", msg.channel, e),
        }
    }
    debug!("Pub/sub loop stopped");
}

/// Decode a pub/sub message by the stream it arrived on.
pub fn decode_event(msg: &PubSubMessage) -> Result<CoordEvent> {
    let channel = msg.channel.as_str();
    if channel.starts_with("presence:") {
        Ok(CoordEvent::Presence(decode(&msg.payload)?))
    } else if channel.starts_with("typing:") {
        Ok(CoordEvent::Typing(decode(&msg.payload)?))
    } else if channel.starts_with("rotation:") {
        Ok(CoordEvent::Rotation(decode(&msg.payload)?))
    } else if channel.starts_with("notify:") {
        Ok(CoordEvent::Notification(decode(&msg.payload)?))
    } else if channel.starts_with("channel:") && channel.ends_with(":events") {
        Ok(CoordEvent::Membership(decode(&msg.payload)?))
    } else {
        Err(KircError::Malformed(format!("unknown stream {}", channel)))
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    rmp_serde::from_slice(payload).map_err(|e| KircError::Malformed(e.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalStore;
    use tokio::sync::mpsc;

    const TTL: Duration = Duration::from_secs(10);

    fn client(store: &LocalStore, name: &str) -> CoordinationClient {
        CoordinationClient::new(Arc::new(store.clone()), name)
    }

    struct Forward(mpsc::UnboundedSender<CoordEvent>);

    #[async_trait]
    impl CoordHandler for Forward {
        async fn handle(&self, event: &CoordEvent) -> Result<()> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CoordHandler for Failing {
        async fn handle(&self, _event: &CoordEvent) -> Result<()> {
            Err(KircError::Malformed("handler refused".into()))
        }
    }

    #[tokio::test]
    async fn concurrent_claims_elect_exactly_one_leader() {
        let store = LocalStore::new();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let c = client(&store, &format!("node{}", i));
            tasks.push(tokio::spawn(async move {
                let won = c.claim_leader("general", TTL).await.unwrap();
                (c.username().to_string(), won)
            }));
        }

        let mut winners = Vec::new();
        for task in tasks {
            let (name, won) = task.await.unwrap();
            if won {
                winners.push(name);
            }
        }

        assert_eq!(winners.len(), 1);
        let leader = client(&store, "observer").get_leader("general").await.unwrap();
        assert_eq!(leader.as_deref(), Some(winners[0].as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn owner_renews_and_expiry_demotes() {
        let store = LocalStore::new();
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");

        assert!(alice.claim_leader("general", TTL).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        // Heartbeat renewal
        assert!(alice.claim_leader("general", TTL).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(!bob.claim_leader("general", TTL).await.unwrap());
        assert_eq!(bob.get_leader("general").await.unwrap().as_deref(), Some("alice"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(bob.get_leader("general").await.unwrap(), None);
        assert!(bob.claim_leader("general", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn resign_is_compare_and_delete() {
        let store = LocalStore::new();
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");

        alice.claim_leader("general", TTL).await.unwrap();
        assert!(!bob.resign_leader("general").await.unwrap());
        assert_eq!(alice.get_leader("general").await.unwrap().as_deref(), Some("alice"));
        assert!(alice.resign_leader("general").await.unwrap());
        assert_eq!(alice.get_leader("general").await.unwrap(), None);
    }

    #[tokio::test]
    async fn join_and_leave_update_members() {
        let store = LocalStore::new();
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");

        alice.join("general").await.unwrap();
        bob.join("general").await.unwrap();
        assert!(alice.members("general").await.unwrap().contains("bob"));

        bob.leave("general").await.unwrap();
        let members = alice.members("general").await.unwrap();
        assert!(!members.contains("bob"));
        assert!(members.contains("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn presence_and_typing_expire() {
        let store = LocalStore::new();
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");

        assert_eq!(bob.get_presence("alice").await.unwrap(), "offline");
        alice.set_presence("away", Duration::from_secs(30)).await.unwrap();
        assert_eq!(bob.get_presence("alice").await.unwrap(), "away");

        alice.set_typing("general", true, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            bob.get_typing_users("general").await.unwrap(),
            BTreeSet::from(["alice".to_string()])
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(bob.get_typing_users("general").await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(bob.get_presence("alice").await.unwrap(), "offline");
    }

    #[tokio::test]
    async fn events_reach_typed_handlers() {
        let store = LocalStore::new();
        let alice = client(&store, "alice");
        let bob = client(&store, "bob");

        let (tx, mut rx) = mpsc::unbounded_channel();
        alice.on(CoordEventKind::Typing, Arc::new(Failing));
        alice.on(CoordEventKind::Typing, Arc::new(Forward(tx.clone())));
        alice.on(CoordEventKind::Rotation, Arc::new(Forward(tx.clone())));
        alice.on(CoordEventKind::Notification, Arc::new(Forward(tx)));
        alice.connect().await.unwrap();
        alice.subscribe_typing("general").await.unwrap();
        alice.subscribe_rotation("general").await.unwrap();

        bob.set_typing("general", true, TTL).await.unwrap();
        bob.publish_rotation("general", "key-2").await.unwrap();
        bob.send_notification("alice", "invite", "join #general").await.unwrap();

        let typing = rx.recv().await.unwrap();
        assert_eq!(
            typing,
            CoordEvent::Typing(TypingEvent {
                channel: "general".into(),
                username: "bob".into(),
                is_typing: true,
            })
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoordEvent::Rotation(RotationEvent {
                channel: "general".into(),
                key_id: "key-2".into(),
            })
        );
        match rx.recv().await.unwrap() {
            CoordEvent::Notification(note) => assert_eq!(note.kind, "invite"),
            other => panic!("unexpected event: {:?}", other),
        }

        alice.disconnect().await;
    }

    #[tokio::test]
    async fn subscribing_requires_connection() {
        let store = LocalStore::new();
        let alice = client(&store, "alice");
        assert!(matches!(
            alice.subscribe_typing("general").await,
            Err(KircError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn store_outage_is_reported_not_retried() {
        let store = LocalStore::new();
        let alice = client(&store, "alice");
        store.set_offline(true);
        assert!(matches!(
            alice.claim_leader("general", TTL).await,
            Err(KircError::Connection(_))
        ));
    }

    #[test]
    fn undecodable_payloads_are_malformed() {
        let msg = PubSubMessage {
            channel: "presence:alice".into(),
            payload: vec![0xc1],
        };
        assert!(matches!(decode_event(&msg), Err(KircError::Malformed(_))));
    }
}
