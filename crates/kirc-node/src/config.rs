use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use kirc_mailbox::KafkaSettings;
use kirc_relay::RelayConfig;

/// Host settings, read from `KIRC_*`, `VALKEY_URI` and `KAFKA_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub username: String,
    pub display_name: String,
    pub db_path: PathBuf,
    /// Base64 identity secret; generated on first start
    pub key_path: PathBuf,
    pub channel: String,
    /// Coordination store, `redis://` or `rediss://`
    pub valkey_uri: String,
    pub kafka: KafkaSettings,
    pub relay: RelayConfig,
}

impl NodeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = var("KIRC_USERNAME").unwrap_or_else(|| "anonymous".into());
        let display_name = var("KIRC_DISPLAY_NAME").unwrap_or_else(|| username.clone());
        let db_path = var("KIRC_DB_PATH").unwrap_or_else(|| format!("{}.db", username));
        let key_path = var("KIRC_KEY_PATH").unwrap_or_else(|| format!("{}.key", username));
        let channel = var("KIRC_CHANNEL").unwrap_or_else(|| "general".into());
        let valkey_uri = var("VALKEY_URI").unwrap_or_else(|| "redis://127.0.0.1:6379".into());
        let kafka = KafkaSettings {
            bootstrap_servers: var("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or_else(|| "localhost:9092".into()),
            security_protocol: var("KAFKA_SECURITY_PROTOCOL")
                .unwrap_or_else(|| "PLAINTEXT".into()),
            ssl_ca: Some(path_or(&var, "KAFKA_SSL_CAFILE", "./certs/kafka_ca.pem")),
            ssl_cert: Some(path_or(&var, "KAFKA_SSL_CERTFILE", "./certs/kafka_service.cert")),
            ssl_key: Some(path_or(&var, "KAFKA_SSL_KEYFILE", "./certs/kafka_service.key")),
        };

        let mut relay = RelayConfig::default();
        if let Some(secs) = var("KIRC_LEASE_TTL_SECS") {
            let secs: u64 = secs.parse().context("KIRC_LEASE_TTL_SECS")?;
            relay.lease_ttl = Duration::from_secs(secs);
            // Renew at a third of the lease
            relay.heartbeat_interval = Duration::from_secs(secs.div_ceil(3).max(1));
        }
        if let Some(ms) = var("KIRC_RPC_TIMEOUT_MS") {
            relay.rpc_timeout = Duration::from_millis(ms.parse().context("KIRC_RPC_TIMEOUT_MS")?);
        }
        if let Some(limit) = var("KIRC_HISTORY_LIMIT") {
            relay.history_limit = limit.parse().context("KIRC_HISTORY_LIMIT")?;
        }

        Ok(Self {
            username,
            display_name,
            db_path: PathBuf::from(db_path),
            key_path: PathBuf::from(key_path),
            channel,
            valkey_uri,
            kafka,
            relay,
        })
    }
}

fn path_or<F>(var: &F, name: &str, default: &str) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    PathBuf::from(var(name).unwrap_or_else(|| default.into()))
}
