use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer as _, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use kirc_types::{KircError, Result};

use crate::broker::{Broker, Consumer, Record};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_millis(200);

fn unreachable(err: KafkaError) -> KircError {
    KircError::Connection(format!("kafka: {}", err))
}

/// Connection settings for a Kafka cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    /// `PLAINTEXT`, `SSL`, `SASL_SSL`...
    pub security_protocol: String,
    pub ssl_ca: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
}

impl KafkaSettings {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("security.protocol", self.security_protocol.to_lowercase());

        if self.security_protocol.to_uppercase().contains("SSL") {
            let files = [
                ("ssl.ca.location", &self.ssl_ca),
                ("ssl.certificate.location", &self.ssl_cert),
                ("ssl.key.location", &self.ssl_key),
            ];
            for (name, path) in files {
                if let Some(path) = path {
                    config.set(name, path.display().to_string());
                }
            }
        }
        config
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut config = self.client_config();
        // A private group per consumer: nothing is shared and topics added
        // later start at their end
        config
            .set("group.id", format!("kirc-{}", uuid::Uuid::new_v4()))
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true")
            .set("partition.assignment.strategy", "cooperative-sticky")
            .set("allow.auto.create.topics", "true");
        config
    }
}

/// Log broker on a Kafka cluster. Records are produced through one shared
/// producer; each consumer is its own consumer group.
pub struct KafkaBroker {
    settings: KafkaSettings,
    producer: FutureProducer,
}

impl KafkaBroker {
    pub fn new(settings: &KafkaSettings) -> Result<Self> {
        let producer: FutureProducer = settings
            .client_config()
            .set("message.timeout.ms", SEND_TIMEOUT.as_millis().to_string())
            .create()
            .map_err(unreachable)?;
        info!("Kafka producer ready for {}", settings.bootstrap_servers);
        Ok(Self {
            settings: settings.clone(),
            producer,
        })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn produce(&self, topic: &str, key: Option<&str>, value: Vec<u8>) -> Result<u64> {
        let mut record = FutureRecord::<str, Vec<u8>>::to(topic).payload(&value);
        if let Some(key) = key {
            record = record.key(key);
        }
        let (_, offset) = self
            .producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| unreachable(e))?;
        Ok(offset.max(0) as u64)
    }

    async fn consumer(&self, topics: &[String]) -> Result<Arc<dyn Consumer>> {
        let consumer: StreamConsumer = self
            .settings
            .consumer_config()
            .create()
            .map_err(unreachable)?;
        let kafka = KafkaConsumer {
            consumer,
            topics: Mutex::new(BTreeSet::new()),
            closed: watch::channel(false).0,
        };
        for topic in topics {
            kafka.subscribe(topic).await?;
        }
        Ok(Arc::new(kafka))
    }
}

/// One consumer group over a changing topic set.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topics: Mutex<BTreeSet<String>>,
    closed: watch::Sender<bool>,
}

impl KafkaConsumer {
    fn lock_topics(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.topics.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Point the group subscription at the current topic set. The
    /// cooperative assignor leaves partitions already held untouched.
    fn resubscribe(&self, topics: &BTreeSet<String>) -> Result<()> {
        if topics.is_empty() {
            self.consumer.unsubscribe();
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names).map_err(unreachable)
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut topics = self.lock_topics();
        if !topics.insert(topic.to_string()) {
            return Ok(());
        }
        debug!("Consuming {}", topic);
        if let Err(e) = self.resubscribe(&topics) {
            topics.remove(topic);
            return Err(e);
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut topics = self.lock_topics();
        if topics.remove(topic) {
            debug!("No longer consuming {}", topic);
            self.resubscribe(&topics)?;
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Record> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return None;
            }
            let received = tokio::select! {
                _ = closed.changed() => return None,
                message = self.consumer.recv() => message.map(|message| Record {
                    topic: message.topic().to_string(),
                    offset: message.offset().max(0) as u64,
                    key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                    value: message.payload().unwrap_or_default().to_vec(),
                }),
            };
            match received {
                Ok(record) => return Some(record),
                Err(e) => {
                    warn!("Kafka consume error: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.consumer.unsubscribe();
        self.lock_topics().clear();
    }
}
