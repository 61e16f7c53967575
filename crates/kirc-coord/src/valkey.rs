use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Client, RedisError, RedisResult, Script};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kirc_types::{KircError, Result};

use crate::store::{KeyValueStore, PubSubMessage, Subscriber};

const EXPIRE_IF_EQ: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

const DELETE_IF_EQ: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const SCAN_COUNT: usize = 100;

fn unreachable(err: RedisError) -> KircError {
    KircError::Connection(format!("valkey: {}", err))
}

/// Whole milliseconds, at least one; `PX 0` is rejected by the server.
fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Escape glob metacharacters so a key prefix matches literally in `SCAN`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

/// Coordination store on a Valkey (or Redis) server. `redis://` and
/// `rediss://` URIs are accepted. One multiplexed connection carries every
/// command; each subscriber gets its own pub/sub connection.
pub struct ValkeyStore {
    client: Client,
    conn: MultiplexedConnection,
    expire_if_eq: Script,
    delete_if_eq: Script,
}

impl ValkeyStore {
    pub async fn connect(uri: &str) -> Result<Self> {
        let client = Client::open(uri).map_err(unreachable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unreachable)?;
        info!("Connected to coordination store");
        Ok(Self {
            client,
            conn,
            expire_if_eq: Script::new(EXPIRE_IF_EQ),
            delete_if_eq: Script::new(DELETE_IF_EQ),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl KeyValueStore for ValkeyStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut self.conn()).await.map_err(unreachable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(set == 1)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let set: i64 = self
            .expire_if_eq
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(set == 1)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let removed: i64 = self
            .delete_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(removed == 1)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>> {
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(members.into_iter().collect())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = glob_escape(prefix);
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = BTreeSet::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(unreachable)?;
            // SCAN may return a key more than once
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys.into_iter().collect())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.conn())
            .await
            .map_err(unreachable)?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscriber(&self) -> Result<Arc<dyn Subscriber>> {
        let pubsub = self.client.get_async_pubsub().await.map_err(unreachable)?;
        Ok(Arc::new(ValkeySubscriber::spawn(pubsub)))
    }
}

type Reply = oneshot::Sender<RedisResult<()>>;

enum Command {
    Subscribe(String, Reply),
    Unsubscribe(String, Reply),
}

/// A pub/sub connection driven by its own task, so subscriptions can change
/// while another task waits for messages.
pub struct ValkeySubscriber {
    commands: mpsc::UnboundedSender<Command>,
    messages: AsyncMutex<mpsc::UnboundedReceiver<PubSubMessage>>,
    task: JoinHandle<()>,
}

impl ValkeySubscriber {
    fn spawn(pubsub: PubSub) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (message_tx, messages) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(pubsub, command_rx, message_tx));
        Self {
            commands,
            messages: AsyncMutex::new(messages),
            task,
        }
    }

    async fn request<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| KircError::Connection("pub/sub connection closed".into()))?;
        rx.await
            .map_err(|_| KircError::Connection("pub/sub connection closed".into()))?
            .map_err(unreachable)
    }
}

async fn drive(
    mut pubsub: PubSub,
    mut commands: mpsc::UnboundedReceiver<Command>,
    messages: mpsc::UnboundedSender<PubSubMessage>,
) {
    loop {
        // The message stream borrows the connection, so it is dropped before
        // each subscription change
        let command = {
            let stream = pubsub.on_message();
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    command = commands.recv() => break command,
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            warn!("Pub/sub connection lost");
                            return;
                        };
                        let message = PubSubMessage {
                            channel: msg.get_channel_name().to_string(),
                            payload: msg.get_payload_bytes().to_vec(),
                        };
                        if messages.send(message).is_err() {
                            return;
                        }
                    }
                }
            }
        };

        match command {
            Some(Command::Subscribe(channel, reply)) => {
                debug!("Subscribing to {}", channel);
                let _ = reply.send(pubsub.subscribe(channel.as_str()).await);
            }
            Some(Command::Unsubscribe(channel, reply)) => {
                debug!("Unsubscribing from {}", channel);
                let _ = reply.send(pubsub.unsubscribe(channel.as_str()).await);
            }
            None => return,
        }
    }
}

#[async_trait]
impl Subscriber for ValkeySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.request(|reply| Command::Subscribe(channel.to_string(), reply))
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.request(|reply| Command::Unsubscribe(channel.to_string(), reply))
            .await
    }

    async fn next_message(&self) -> Option<PubSubMessage> {
        self.messages.lock().await.recv().await
    }

    async fn close(&self) {
        // Aborting drops the sender, which wakes any waiting reader
        self.task.abort();
        self.messages.lock().await.close();
    }
}

impl Drop for ValkeySubscriber {
    fn drop(&mut self) {
        self.task.abort();
    }
}
