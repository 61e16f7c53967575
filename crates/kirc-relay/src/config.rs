use std::time::Duration;

/// What to do with a channel message whose key id is missing or unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyFallback {
    /// Try every locally known key for the channel. AES-GCM rejects a wrong
    /// key, so a mismatch can only end in the locked placeholder.
    #[default]
    TryKnownKeys,
    /// Locked unless the key id matches exactly.
    FailClosed,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub lease_ttl: Duration,
    pub presence_ttl: Duration,
    /// Presence refresh and lease renewal period; must be well under
    /// `lease_ttl`
    pub heartbeat_interval: Duration,
    pub typing_ttl: Duration,
    pub rpc_timeout: Duration,
    pub history_limit: u32,
    pub key_fallback: KeyFallback,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            presence_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(10),
            typing_ttl: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
            history_limit: 50,
            key_fallback: KeyFallback::default(),
        }
    }
}
