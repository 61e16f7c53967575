use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast};
use tokio::time::Instant;
use tracing::warn;

use kirc_types::{KircError, Result};

use crate::store::{KeyValueStore, PubSubMessage, Subscriber};

enum Value {
    Text(String),
    Set(BTreeSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process coordination store with TTL expiry on the tokio clock and
/// pub/sub fan-out. Clones share the same state, so every node of a local
/// network holds a clone.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<LocalStoreInner>,
}

struct LocalStoreInner {
    entries: Mutex<HashMap<String, Entry>>,

    /// Pub/sub bus. Every subscriber sees every message and filters by its
    /// own subscription set
    bus: broadcast::Sender<PubSubMessage>,

    /// Simulated outage: every call fails with a connection error
    offline: AtomicBool,
}

impl LocalStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(LocalStoreInner {
                entries: Mutex::new(HashMap::new()),
                bus,
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Toggle a simulated connectivity loss.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(KircError::Connection("coordination store unreachable".into()));
        }
        Ok(())
    }

    /// Lock the keyspace with expired keys purged.
    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.check_online()?;
        let mut entries = self
            .inner
            .entries
            .lock()
            .map_err(|e| KircError::Connection(format!("store lock poisoned: {}", e)))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(entries)
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl KeyValueStore for LocalStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: deadline(Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries()?.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.entries()?.get(key) {
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Some(text.clone()),
            _ => None,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(match self.entries()?.get_mut(key) {
            Some(entry) => {
                entry.expires_at = deadline(Some(ttl));
                true
            }
            None => false,
        })
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        Ok(match self.entries()?.get_mut(key) {
            Some(entry) if matches!(&entry.value, Value::Text(v) if v == expected) => {
                entry.expires_at = deadline(Some(ttl));
                true
            }
            _ => false,
        })
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        let owned = matches!(
            entries.get(key),
            Some(Entry { value: Value::Text(v), .. }) if v == expected
        );
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(members) => Ok(members.insert(member.to_string())),
            Value::Text(_) => Err(KircError::Connection(format!(
                "WRONGTYPE: {} does not hold a set",
                key
            ))),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        let removed = match entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => members.remove(member),
            _ => false,
        };
        if matches!(entries.get(key), Some(Entry { value: Value::Set(m), .. }) if m.is_empty()) {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(match self.entries()?.get(key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => members.clone(),
            _ => BTreeSet::new(),
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries()?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        self.check_online()?;
        // No receivers is not an error for pub/sub
        Ok(self
            .inner
            .bus
            .send(PubSubMessage {
                channel: channel.to_string(),
                payload,
            })
            .unwrap_or(0))
    }

    async fn subscriber(&self) -> Result<Arc<dyn Subscriber>> {
        self.check_online()?;
        Ok(Arc::new(LocalSubscriber {
            channels: RwLock::new(HashSet::new()),
            rx: AsyncMutex::new(self.inner.bus.subscribe()),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }))
    }
}

struct LocalSubscriber {
    channels: RwLock<HashSet<String>>,
    rx: AsyncMutex<broadcast::Receiver<PubSubMessage>>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl LocalSubscriber {
    fn is_subscribed(&self, channel: &str) -> bool {
        self.channels
            .read()
            .map(|channels| channels.contains(channel))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Subscriber for LocalSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.channels
            .write()
            .map_err(|e| KircError::Connection(e.to_string()))?
            .insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.channels
            .write()
            .map_err(|e| KircError::Connection(e.to_string()))?
            .remove(channel);
        Ok(())
    }

    async fn next_message(&self) -> Option<PubSubMessage> {
        let mut rx = self.rx.lock().await;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            tokio::select! {
                _ = self.close_signal.notified() => return None,
                result = rx.recv() => match result {
                    Ok(msg) if self.is_subscribed(&msg.channel) => return Some(msg),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Pub/sub receiver lagged by {} messages", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // notify_one keeps a permit if nobody is waiting yet
        self.close_signal.notify_one();
    }
}
