use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use kirc_types::handlers::HandlerTable;
use kirc_types::{Envelope, KircError, MessageType, Result, topics};

use crate::broker::{Broker, Consumer, Record};

/// Typed callback for inbound envelopes of one message kind.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
enum Lane {
    Data,
    Rpc,
}

/// A node's mailbox: producer plus independent data and RPC consume loops.
/// Cheap to clone.
#[derive(Clone)]
pub struct MailboxTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    broker: Arc<dyn Broker>,
    username: String,
    connected: AtomicBool,

    data_consumer: RwLock<Option<Arc<dyn Consumer>>>,
    rpc_consumer: RwLock<Option<Arc<dyn Consumer>>>,

    /// Other identities' outboxes, restored on reconnect
    subscriptions: Mutex<BTreeSet<String>>,

    /// correlation id -> single-fulfillment waiter
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,

    message_handlers: HandlerTable<MessageType, dyn MessageHandler>,
    rpc_handlers: HandlerTable<MessageType, dyn MessageHandler>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MailboxTransport {
    pub fn new(broker: Arc<dyn Broker>, username: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                broker,
                username: username.into(),
                connected: AtomicBool::new(false),
                data_consumer: RwLock::new(None),
                rpc_consumer: RwLock::new(None),
                subscriptions: Mutex::new(BTreeSet::new()),
                pending: Mutex::new(HashMap::new()),
                message_handlers: HandlerTable::new(),
                rpc_handlers: HandlerTable::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Start both consume loops. Each consumer begins at the end of its
    /// topics; history is fetched by RPC, never replayed from the log.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let me = &self.inner.username;

        let mut data_topics = vec![topics::inbox(me)];
        data_topics.extend(lock(&self.inner.subscriptions).iter().cloned());
        let data = self.inner.broker.consumer(&data_topics).await?;
        let rpc = self.inner.broker.consumer(&[topics::rpc_in(me)]).await?;

        let weak = Arc::downgrade(&self.inner);
        let data_task = tokio::spawn(consume_loop(data.clone(), weak.clone(), Lane::Data));
        let rpc_task = tokio::spawn(consume_loop(rpc.clone(), weak, Lane::Rpc));

        *write_lock(&self.inner.data_consumer) = Some(data);
        *write_lock(&self.inner.rpc_consumer) = Some(rpc);
        lock(&self.inner.tasks).extend([data_task, rpc_task]);
        self.inner.connected.store(true, Ordering::SeqCst);

        info!("{} mailbox connected ({} data topics)", me, data_topics.len());
        Ok(())
    }

    /// Stop both loops. Outstanding requests fail with `NotConnected`.
    pub async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);

        let consumers = [
            write_lock(&self.inner.data_consumer).take(),
            write_lock(&self.inner.rpc_consumer).take(),
        ];
        for consumer in consumers.into_iter().flatten() {
            consumer.close().await;
        }
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        lock(&self.inner.pending).clear();

        info!("{} mailbox disconnected", self.inner.username);
    }

    // -- Subscriptions --

    /// Start reading another identity's outbox. The node's own outbox is
    /// refused: reading it back would let a leader relay its own messages.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        if topic == topics::outbox(&self.inner.username) {
            return Err(KircError::Authorization {
                user: self.inner.username.clone(),
                action: "subscribe to its own outbox".into(),
            });
        }

        let added = lock(&self.inner.subscriptions).insert(topic.to_string());
        let consumer = read_lock(&self.inner.data_consumer).clone();
        if let Some(consumer) = consumer {
            consumer.subscribe(topic).await?;
        }
        if added {
            debug!("{} subscribed to {}", self.inner.username, topic);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let removed = lock(&self.inner.subscriptions).remove(topic);
        let consumer = read_lock(&self.inner.data_consumer).clone();
        if let Some(consumer) = consumer {
            consumer.unsubscribe(topic).await?;
        }
        if removed {
            debug!("{} unsubscribed from {}", self.inner.username, topic);
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        lock(&self.inner.subscriptions).clone()
    }

    // -- Sending --

    /// Send on the data plane; defaults to the node's own outbox.
    pub async fn send(&self, envelope: &Envelope, target: Option<&str>) -> Result<()> {
        let topic = target
            .map(str::to_string)
            .unwrap_or_else(|| topics::outbox(&self.inner.username));
        self.produce(&topic, envelope).await
    }

    /// Send on the RPC plane; defaults to the node's own rpc-out.
    pub async fn send_rpc(&self, envelope: &Envelope, target: Option<&str>) -> Result<()> {
        let topic = target
            .map(str::to_string)
            .unwrap_or_else(|| topics::rpc_out(&self.inner.username));
        self.produce(&topic, envelope).await
    }

    async fn produce(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        if !self.is_connected() {
            return Err(KircError::NotConnected);
        }
        let key = envelope.channel.as_deref().unwrap_or(&envelope.sender);
        let bytes = envelope.to_bytes()?;
        let offset = self.inner.broker.produce(topic, Some(key), bytes).await?;
        trace!("{} {} -> {}@{}", envelope.kind, envelope.id, topic, offset);
        Ok(())
    }

    /// Send an RPC to `target` and wait for the response carrying the same
    /// correlation id. On timeout the waiter is removed; the sent request is
    /// not recalled.
    pub async fn request(
        &self,
        mut envelope: Envelope,
        target: &str,
        timeout: Duration,
    ) -> Result<Envelope> {
        let correlation_id = *envelope.correlation_id.get_or_insert_with(Uuid::new_v4);

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(correlation_id, tx);
        // Removes the waiter however this call ends, including cancellation
        let _waiter = PendingGuard {
            inner: &self.inner,
            correlation_id,
        };

        self.send_rpc(&envelope, Some(target)).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(KircError::NotConnected),
            Err(_) => {
                warn!(
                    "{} request {} to {} timed out after {:?}",
                    envelope.kind, correlation_id, target, timeout
                );
                Err(KircError::Timeout {
                    correlation_id,
                    elapsed: timeout,
                })
            }
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    // -- Handlers --

    pub fn on_message(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        self.inner.message_handlers.register(kind, handler);
    }

    pub fn on_rpc(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        self.inner.rpc_handlers.register(kind, handler);
    }
}

struct PendingGuard<'a> {
    inner: &'a TransportInner,
    correlation_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.correlation_id);
    }
}

impl TransportInner {
    async fn handle_record(&self, record: Record, lane: Lane) {
        let envelope = match Envelope::from_bytes(&record.value) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "Dropping malformed record {}@{}: {}",
                    record.topic, record.offset, e
                );
                return;
            }
        };

        let handlers = match lane {
            Lane::Data => &self.message_handlers,
            Lane::Rpc => {
                // A correlated response belongs to its waiter alone
                if let Some(waiter) = self.take_waiter(&envelope) {
                    trace!("Response {:?} matched a waiter", envelope.correlation_id);
                    let _ = waiter.send(envelope);
                    return;
                }
                &self.rpc_handlers
            }
        };

        let registered = handlers.handlers_for(envelope.kind);
        if registered.is_empty() {
            debug!("No {:?} handler for {} from {}", lane, envelope.kind, envelope.sender);
            return;
        }

        for handler in registered {
            match AssertUnwindSafe(handler.handle(&envelope)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "{:?} handler failed on {} {}: {}",
                    lane, envelope.kind, envelope.id, e
                ),
                Err(_) => error!(
                    "{:?} handler panicked on {} {}",
                    lane, envelope.kind, envelope.id
                ),
            }
        }
    }

    fn take_waiter(&self, envelope: &Envelope) -> Option<oneshot::Sender<Envelope>> {
        let correlation_id = envelope.correlation_id?;
        lock(&self.pending).remove(&correlation_id)
    }
}

async fn consume_loop(consumer: Arc<dyn Consumer>, inner: Weak<TransportInner>, lane: Lane) {
    while let Some(record) = consumer.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_record(record, lane).await;
    }
    debug!("{:?} consume loop stopped", lane);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
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
    use crate::memory::LocalBroker;
    use kirc_types::Payload;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Envelope>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, envelope: &Envelope) -> Result<()> {
            let _ = self.0.send(envelope.clone());
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl MessageHandler for Panics {
        async fn handle(&self, _envelope: &Envelope) -> Result<()> {
            panic!("handler bug");
        }
    }

    /// Answers pings on the peer's rpc-in.
    struct Ponger(MailboxTransport);

    #[async_trait]
    impl MessageHandler for Ponger {
        async fn handle(&self, envelope: &Envelope) -> Result<()> {
            let reply = envelope.reply(MessageType::Pong, self.0.username(), Payload::Empty);
            self.0
                .send_rpc(&reply, Some(&topics::rpc_in(&envelope.sender)))
                .await
        }
    }

    async fn node(broker: &LocalBroker, name: &str) -> MailboxTransport {
        let transport = MailboxTransport::new(Arc::new(broker.clone()), name);
        transport.connect().await.unwrap();
        transport
    }

    fn chat(sender: &str, text: &str) -> Envelope {
        Envelope::new(
            MessageType::Chat,
            sender,
            Payload::Text {
                content: text.into(),
            },
        )
        .in_channel("general")
    }

    #[tokio::test]
    async fn inbox_messages_reach_handlers_despite_failures() {
        let broker = LocalBroker::new();
        let alice = node(&broker, "alice").await;
        let bob = node(&broker, "bob").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_message(MessageType::Chat, Arc::new(Panics));
        bob.on_message(MessageType::Chat, Arc::new(Forward(tx)));

        broker
            .produce(&topics::inbox("bob"), None, b"\xc1garbage".to_vec())
            .await
            .unwrap();
        alice.send(&chat("alice", "one"), Some(&topics::inbox("bob"))).await.unwrap();
        alice.send(&chat("alice", "two"), Some(&topics::inbox("bob"))).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload, Payload::Text { content: "one".into() });
        assert_eq!(second.payload, Payload::Text { content: "two".into() });
    }

    #[tokio::test]
    async fn outbox_subscription_delivers_leader_broadcasts() {
        let broker = LocalBroker::new();
        let leader = node(&broker, "leader").await;
        let member = node(&broker, "member").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        member.on_message(MessageType::Chat, Arc::new(Forward(tx)));
        member.subscribe(&topics::outbox("leader")).await.unwrap();

        leader.send(&chat("leader", "hello all"), None).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.sender, "leader");
        assert_eq!(broker.records("out-leader").len(), 1);
    }

    #[tokio::test]
    async fn own_outbox_subscription_is_refused() {
        let broker = LocalBroker::new();
        let alice = node(&broker, "alice").await;
        assert!(matches!(
            alice.subscribe("out-alice").await,
            Err(KircError::Authorization { .. })
        ));
        assert!(alice.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn response_goes_only_to_its_waiter() {
        let broker = LocalBroker::new();
        let alice = node(&broker, "alice").await;
        let bob = node(&broker, "bob").await;
        bob.on_rpc(MessageType::Ping, Arc::new(Ponger(bob.clone())));

        let (tx, mut rx) = mpsc::unbounded_channel();
        alice.on_rpc(MessageType::Pong, Arc::new(Forward(tx)));

        let ping = Envelope::new(MessageType::Ping, "alice", Payload::Empty);
        let pong = alice
            .request(ping, &topics::rpc_in("bob"), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(pong.kind, MessageType::Pong);
        assert_eq!(pong.sender, "bob");
        assert_eq!(alice.pending_requests(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_requests_leave_no_waiters() {
        let broker = LocalBroker::new();
        let alice = node(&broker, "alice").await;
        let timeout = Duration::from_millis(500);

        for _ in 0..5 {
            let started = tokio::time::Instant::now();
            let ping = Envelope::new(MessageType::Ping, "alice", Payload::Empty);
            let err = alice
                .request(ping, &topics::rpc_in("nobody"), timeout)
                .await
                .unwrap_err();

            assert!(matches!(err, KircError::Timeout { elapsed, .. } if elapsed == timeout));
            assert!(started.elapsed() >= timeout);
            assert!(started.elapsed() < timeout * 2);
        }
        assert_eq!(alice.pending_requests(), 0);
    }

    #[tokio::test]
    async fn failed_send_removes_waiter() {
        let broker = LocalBroker::new();
        let alice = node(&broker, "alice").await;
        broker.set_offline(true);

        let ping = Envelope::new(MessageType::Ping, "alice", Payload::Empty);
        let err = alice
            .request(ping, &topics::rpc_in("bob"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, KircError::Connection(_)));
        assert_eq!(alice.pending_requests(), 0);
    }

    #[tokio::test]
    async fn sending_requires_connection() {
        let broker = LocalBroker::new();
        let alice = MailboxTransport::new(Arc::new(broker), "alice");
        assert!(matches!(
            alice.send(&chat("alice", "hi"), None).await,
            Err(KircError::NotConnected)
        ));
    }
}
