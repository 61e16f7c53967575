use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use kirc_types::{KircError, Result};

use crate::broker::{Broker, Consumer, Record};

struct Stored {
    record: Record,
    /// Broker-wide append order, used to interleave topics fairly
    seq: u64,
}

#[derive(Default)]
struct Log {
    topics: HashMap<String, Vec<Stored>>,
    next_seq: u64,
}

/// In-process append-only log broker. Clones share the same logs.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    log: Mutex<Log>,
    /// Woken on every append and on consumer close
    appended: Notify,
    offline: AtomicBool,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                log: Mutex::new(Log::default()),
                appended: Notify::new(),
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Toggle a simulated broker outage.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Snapshot of a topic's log, for inspection.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.inner
            .lock_log()
            .topics
            .get(topic)
            .map(|log| log.iter().map(|stored| stored.record.clone()).collect())
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(KircError::Connection("broker unreachable".into()));
        }
        Ok(())
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerInner {
    fn lock_log(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn end_of(&self, topic: &str) -> usize {
        self.lock_log().topics.get(topic).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn produce(&self, topic: &str, key: Option<&str>, value: Vec<u8>) -> Result<u64> {
        self.check_online()?;
        let offset = {
            let mut log = self.inner.lock_log();
            let seq = log.next_seq;
            log.next_seq += 1;
            let entries = log.topics.entry(topic.to_string()).or_default();
            let offset = entries.len() as u64;
            entries.push(Stored {
                record: Record {
                    topic: topic.to_string(),
                    offset,
                    key: key.map(str::to_string),
                    value,
                },
                seq,
            });
            offset
        };
        self.inner.appended.notify_waiters();
        Ok(offset)
    }

    async fn consumer(&self, topics: &[String]) -> Result<Arc<dyn Consumer>> {
        self.check_online()?;
        let positions = topics
            .iter()
            .map(|topic| (topic.clone(), self.inner.end_of(topic)))
            .collect();
        Ok(Arc::new(LocalConsumer {
            broker: self.inner.clone(),
            positions: Mutex::new(positions),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalConsumer {
    broker: Arc<BrokerInner>,
    /// topic -> index of the next record to deliver
    positions: Mutex<HashMap<String, usize>>,
    closed: AtomicBool,
}

impl LocalConsumer {
    fn lock_positions(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.positions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the oldest undelivered record across all subscribed topics.
    fn poll(&self) -> Option<Record> {
        let mut positions = self.lock_positions();
        let log = self.broker.lock_log();

        let (topic, stored) = positions
            .iter()
            .filter_map(|(topic, &next)| {
                log.topics
                    .get(topic)
                    .and_then(|entries| entries.get(next))
                    .map(|stored| (topic.clone(), stored))
            })
            .min_by_key(|(_, stored)| stored.seq)?;

        let record = stored.record.clone();
        if let Some(next) = positions.get_mut(&topic) {
            *next += 1;
        }
        Some(record)
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        let end = self.broker.end_of(topic);
        self.lock_positions().entry(topic.to_string()).or_insert(end);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.lock_positions().remove(topic);
        Ok(())
    }

    async fn recv(&self) -> Option<Record> {
        loop {
            // Register for wakeups before checking, so an append between the
            // check and the await is not missed
            let appended = self.broker.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(record) = self.poll() {
                return Some(record);
            }
            appended.await;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.broker.appended.notify_waiters();
    }
}
