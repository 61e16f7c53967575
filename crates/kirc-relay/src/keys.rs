use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kirc_coord::CoordinationClient;
use kirc_crypto::keys::public_key_from_base64;
use kirc_crypto::{ChannelKey, Identity, decrypt_text, encrypt_text, open, seal};
use kirc_db::Database;
use kirc_mailbox::MailboxTransport;
use kirc_types::{Envelope, KircError, MessageType, Payload, Result, topics};

use crate::config::KeyFallback;
use crate::store::with_db;

#[derive(Default)]
struct ChannelKeys {
    /// Oldest first
    keys: Vec<(String, ChannelKey)>,
    active: Option<String>,
}

/// Every channel key this node holds, plus the active key id per channel.
#[derive(Default)]
pub struct Keyring {
    channels: HashMap<String, ChannelKeys>,
}

impl Keyring {
    pub fn get(&self, channel: &str, key_id: &str) -> Option<&ChannelKey> {
        self.channels
            .get(channel)?
            .keys
            .iter()
            .find(|(id, _)| id == key_id)
            .map(|(_, key)| key)
    }

    pub fn contains(&self, channel: &str, key_id: &str) -> bool {
        self.get(channel, key_id).is_some()
    }

    pub fn has_keys(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|keys| !keys.keys.is_empty())
    }

    pub fn active_key_id(&self, channel: &str) -> Option<&str> {
        self.channels.get(channel)?.active.as_deref()
    }

    pub fn active(&self, channel: &str) -> Option<(&str, &ChannelKey)> {
        let key_id = self.active_key_id(channel)?;
        Some((key_id, self.get(channel, key_id)?))
    }

    /// Known key ids, oldest first.
    pub fn key_ids(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|keys| keys.keys.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Store a key and make it active. An existing key id keeps its
    /// original key material.
    fn insert(&mut self, channel: &str, key_id: &str, key: ChannelKey) {
        let entry = self.channels.entry(channel.to_string()).or_default();
        if !entry.keys.iter().any(|(id, _)| id == key_id) {
            entry.keys.push((key_id.to_string(), key));
        }
        entry.active = Some(key_id.to_string());
    }
}

/// How an inbound channel message can be decrypted.
#[derive(Debug, Clone)]
pub enum KeyResolution {
    /// The message's key id is known
    Exact(ChannelKey),
    /// Key id missing or unknown: candidate keys, newest first
    Fallback(Vec<ChannelKey>),
    /// Nothing to try
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub channel: String,
    pub key_id: String,
    /// Members sent a sealed key update
    pub delivered: usize,
    /// Members skipped for lack of a stored public key
    pub skipped: Vec<String>,
}

/// Generation, distribution, persistence and rotation of channel keys.
pub struct KeyManager {
    username: String,
    identity: Identity,
    db: Arc<Database>,
    coord: CoordinationClient,
    transport: MailboxTransport,
    keyring: RwLock<Keyring>,
    fallback: KeyFallback,
}

impl KeyManager {
    pub fn new(
        identity: Identity,
        db: Arc<Database>,
        coord: CoordinationClient,
        transport: MailboxTransport,
        fallback: KeyFallback,
    ) -> Self {
        Self {
            username: coord.username().to_string(),
            identity,
            db,
            coord,
            transport,
            keyring: RwLock::new(Keyring::default()),
            fallback,
        }
    }

    /// Read-only view of the keyring. Do not hold across an await.
    pub fn keyring(&self) -> RwLockReadGuard<'_, Keyring> {
        self.keyring
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn keyring_mut(&self) -> RwLockWriteGuard<'_, Keyring> {
        self.keyring
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_keys(&self, channel: &str) -> bool {
        self.keyring().has_keys(channel)
    }

    /// Issue a new channel key and hand it to every member with a stored
    /// public key. Only the current lease holder may rotate.
    pub async fn rotate(&self, channel: &str) -> Result<RotationReport> {
        let leader = self.coord.get_leader(channel).await?;
        if leader.as_deref() != Some(self.username.as_str()) {
            return Err(KircError::Authorization {
                user: self.username.clone(),
                action: format!("rotate the key of {}", channel),
            });
        }

        let key_id = {
            let keyring = self.keyring();
            loop {
                let candidate = Uuid::new_v4().to_string();
                if !keyring.contains(channel, &candidate) {
                    break candidate;
                }
            }
        };
        let key = ChannelKey::generate();
        self.keyring_mut().insert(channel, &key_id, key.clone());

        let own_copy = BASE64.encode(seal(self.identity.public_key(), key.as_bytes())?);
        self.persist(channel, &key_id, own_copy).await?;

        let member_keys = self.member_public_keys(channel).await?;
        let mut delivered = 0;
        let mut skipped = Vec::new();
        for (member, public_key) in member_keys {
            let Some(public_key) = public_key else {
                debug!("No public key for {}, skipping key update", member);
                skipped.push(member);
                continue;
            };
            match self.send_key(channel, &key_id, &key, &member, &public_key).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Key update for {} to {} failed: {}", channel, member, e),
            }
        }

        // Signal for members that could not be sent the key
        self.coord.publish_rotation(channel, &key_id).await?;

        info!(
            "Rotated {} to key {} ({} delivered, {} skipped)",
            channel,
            key_id,
            delivered,
            skipped.len()
        );
        Ok(RotationReport {
            channel: channel.to_string(),
            key_id,
            delivered,
            skipped,
        })
    }

    /// Hand the active key to one member, typically a late joiner. Returns
    /// false when there is no active key or no stored public key.
    pub async fn share_active(&self, channel: &str, member: &str) -> Result<bool> {
        let active = self
            .keyring()
            .active(channel)
            .map(|(key_id, key)| (key_id.to_string(), key.clone()));
        let Some((key_id, key)) = active else {
            return Ok(false);
        };

        let name = member.to_string();
        let public_key =
            with_db(&self.db, move |db| Ok(db.get_contact(&name)?.and_then(|c| c.public_key)))
                .await?;
        let Some(public_key) = public_key else {
            debug!("No public key for {}, not sharing {} key", member, channel);
            return Ok(false);
        };

        self.send_key(channel, &key_id, &key, member, &public_key).await?;
        debug!("Shared key {} of {} with {}", key_id, channel, member);
        Ok(true)
    }

    async fn member_public_keys(&self, channel: &str) -> Result<Vec<(String, Option<String>)>> {
        let members: Vec<String> = self
            .coord
            .members(channel)
            .await?
            .into_iter()
            .filter(|member| member != &self.username)
            .collect();

        with_db(&self.db, move |db| {
            members
                .into_iter()
                .map(|member| {
                    let public_key = db.get_contact(&member)?.and_then(|c| c.public_key);
                    Ok((member, public_key))
                })
                .collect()
        })
        .await
    }

    async fn send_key(
        &self,
        channel: &str,
        key_id: &str,
        key: &ChannelKey,
        member: &str,
        public_key: &str,
    ) -> Result<()> {
        let public_key = public_key_from_base64(public_key)?;
        let sealed_key = BASE64.encode(seal(&public_key, key.as_bytes())?);
        let update = Envelope::new(
            MessageType::ChannelKeyUpdate,
            self.username.as_str(),
            Payload::ChannelKeyUpdate {
                channel: channel.to_string(),
                key_id: key_id.to_string(),
                sealed_key,
            },
        )
        .in_channel(channel)
        .to(member);
        self.transport
            .send_rpc(&update, Some(&topics::rpc_in(member)))
            .await
    }

    async fn persist(&self, channel: &str, key_id: &str, sealed_key: String) -> Result<()> {
        let channel = channel.to_string();
        let key_id = key_id.to_string();
        with_db(&self.db, move |db| {
            db.save_channel_key(&channel, &key_id, &sealed_key)
        })
        .await
    }

    /// Unseal a key update addressed to this node and make it active.
    /// Bad updates are logged and dropped. Returns whether a key was applied.
    pub async fn apply_incoming_key_update(&self, envelope: &Envelope) -> bool {
        match self.try_apply(envelope).await {
            Ok(key_id) => {
                info!("Applied key {} from {}", key_id, envelope.sender);
                true
            }
            Err(e) => {
                warn!("Dropping key update {} from {}: {}", envelope.id, envelope.sender, e);
                false
            }
        }
    }

    async fn try_apply(&self, envelope: &Envelope) -> Result<String> {
        let Payload::ChannelKeyUpdate {
            channel,
            key_id,
            sealed_key,
        } = &envelope.payload
        else {
            return Err(KircError::Malformed("not a channel key update".into()));
        };

        let sealed = BASE64
            .decode(sealed_key)
            .map_err(|e| KircError::Malformed(e.to_string()))?;
        let key = ChannelKey::from_slice(&open(&self.identity, &sealed)?)?;

        self.keyring_mut().insert(channel, key_id, key);
        // The blob is already sealed to this node, so it is the durable copy
        self.persist(channel, key_id, sealed_key.clone()).await?;
        Ok(key_id.clone())
    }

    /// Restore persisted keys for a channel. The newest becomes active.
    pub async fn load_persisted(&self, channel: &str) -> Result<usize> {
        let name = channel.to_string();
        let rows = with_db(&self.db, move |db| db.get_channel_keys(&name)).await?;

        let mut loaded = 0;
        for row in rows {
            let key = BASE64
                .decode(&row.sealed_key)
                .map_err(|e| KircError::Malformed(e.to_string()))
                .and_then(|sealed| Ok(open(&self.identity, &sealed)?))
                .and_then(|bytes| Ok(ChannelKey::from_slice(&bytes)?));
            match key {
                Ok(key) => {
                    self.keyring_mut().insert(channel, &row.key_id, key);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping stored key {} for {}: {}", row.key_id, channel, e),
            }
        }
        if loaded > 0 {
            debug!("Loaded {} keys for {}", loaded, channel);
        }
        Ok(loaded)
    }

    pub fn resolve_decrypt_key(&self, channel: &str, key_id: Option<&str>) -> KeyResolution {
        let keyring = self.keyring();
        if let Some(key) = key_id.and_then(|id| keyring.get(channel, id)) {
            return KeyResolution::Exact(key.clone());
        }

        match self.fallback {
            KeyFallback::FailClosed => KeyResolution::Locked,
            KeyFallback::TryKnownKeys => {
                let candidates: Vec<ChannelKey> = keyring
                    .channels
                    .get(channel)
                    .map(|keys| keys.keys.iter().rev().map(|(_, key)| key.clone()).collect())
                    .unwrap_or_default();
                if candidates.is_empty() {
                    KeyResolution::Locked
                } else {
                    KeyResolution::Fallback(candidates)
                }
            }
        }
    }

    /// Decrypt channel content; `None` means locked.
    pub fn decrypt(&self, channel: &str, key_id: Option<&str>, ciphertext: &str) -> Option<String> {
        match self.resolve_decrypt_key(channel, key_id) {
            KeyResolution::Exact(key) => decrypt_text(&key, ciphertext).ok(),
            KeyResolution::Fallback(candidates) => {
                debug!("Key {:?} unknown for {}, trying known keys", key_id, channel);
                candidates
                    .iter()
                    .find_map(|key| decrypt_text(key, ciphertext).ok())
            }
            KeyResolution::Locked => None,
        }
    }

    /// Outbound payload under the channel's active key, or plaintext when
    /// the channel has none.
    pub fn encrypt_outbound(&self, channel: &str, text: &str) -> Result<Payload> {
        let keyring = self.keyring();
        match keyring.active(channel) {
            Some((key_id, key)) => Ok(Payload::Encrypted {
                ciphertext: encrypt_text(key, text)?,
                key_id: Some(key_id.to_string()),
            }),
            None => Ok(Payload::Text {
                content: text.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirc_coord::LocalStore;
    use kirc_mailbox::LocalBroker;
    use kirc_types::models::Contact;
    use std::time::Duration;

    fn manager(fallback: KeyFallback) -> KeyManager {
        let store = LocalStore::new();
        let broker = LocalBroker::new();
        KeyManager::new(
            Identity::generate(),
            Arc::new(Database::open_in_memory().unwrap()),
            CoordinationClient::new(Arc::new(store), "alice"),
            MailboxTransport::new(Arc::new(broker), "alice"),
            fallback,
        )
    }

    #[test]
    fn keyring_tracks_active_key() {
        let mut keyring = Keyring::default();
        assert!(!keyring.has_keys("general"));

        keyring.insert("general", "k1", ChannelKey::generate());
        keyring.insert("general", "k2", ChannelKey::generate());
        assert_eq!(keyring.active_key_id("general"), Some("k2"));
        assert_eq!(keyring.key_ids("general"), vec!["k1", "k2"]);

        let original = keyring.get("general", "k1").cloned();
        keyring.insert("general", "k1", ChannelKey::generate());
        assert_eq!(keyring.get("general", "k1").cloned(), original);
        assert_eq!(keyring.active_key_id("general"), Some("k1"));
    }

    #[tokio::test]
    async fn non_leader_cannot_rotate() {
        let keys = manager(KeyFallback::TryKnownKeys);
        let err = keys.rotate("general").await.unwrap_err();
        assert!(matches!(err, KircError::Authorization { .. }));
        assert!(!keys.has_keys("general"));
    }

    #[tokio::test]
    async fn rotation_never_reuses_key_ids() {
        let keys = manager(KeyFallback::TryKnownKeys);
        keys.transport.connect().await.unwrap();
        keys.coord
            .claim_leader("general", Duration::from_secs(30))
            .await
            .unwrap();
        keys.coord.join("general").await.unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let report = keys.rotate("general").await.unwrap();
            assert!(seen.insert(report.key_id.clone()));
            assert_eq!(keys.keyring().active_key_id("general"), Some(report.key_id.as_str()));
        }
        assert_eq!(keys.keyring().key_ids("general").len(), 10);
    }

    #[tokio::test]
    async fn members_without_public_key_are_skipped() {
        let store = LocalStore::new();
        let broker = LocalBroker::new();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bob = Identity::generate();
        db.save_contact(&Contact::new("bob", "local").with_public_key(bob.public_key_base64()))
            .unwrap();

        let coord = CoordinationClient::new(Arc::new(store.clone()), "alice");
        let transport = MailboxTransport::new(Arc::new(broker.clone()), "alice");
        transport.connect().await.unwrap();
        let keys = KeyManager::new(
            Identity::generate(),
            db,
            coord.clone(),
            transport,
            KeyFallback::TryKnownKeys,
        );

        coord.claim_leader("general", Duration::from_secs(30)).await.unwrap();
        for member in ["alice", "bob", "carol"] {
            CoordinationClient::new(Arc::new(store.clone()), member)
                .join("general")
                .await
                .unwrap();
        }

        let report = keys.rotate("general").await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, vec!["carol".to_string()]);

        let updates = broker.records(&topics::rpc_in("bob"));
        assert_eq!(updates.len(), 1);
        assert!(broker.records(&topics::rpc_in("carol")).is_empty());

        // The update opens with bob's identity and nothing else
        let update = Envelope::from_bytes(&updates[0].value).unwrap();
        let bob_keys = KeyManager::new(
            bob,
            Arc::new(Database::open_in_memory().unwrap()),
            CoordinationClient::new(Arc::new(store), "bob"),
            MailboxTransport::new(Arc::new(broker), "bob"),
            KeyFallback::TryKnownKeys,
        );
        assert!(bob_keys.apply_incoming_key_update(&update).await);
        assert_eq!(
            bob_keys.keyring().active_key_id("general"),
            Some(report.key_id.as_str())
        );
    }

    #[tokio::test]
    async fn bad_key_updates_are_dropped() {
        let keys = manager(KeyFallback::TryKnownKeys);
        let forged = Envelope::new(
            MessageType::ChannelKeyUpdate,
            "mallory",
            Payload::ChannelKeyUpdate {
                channel: "general".into(),
                key_id: "k1".into(),
                sealed_key: BASE64.encode(b"definitely not sealed"),
            },
        );
        assert!(!keys.apply_incoming_key_update(&forged).await);

        let wrong_kind = Envelope::new(MessageType::ChannelKeyUpdate, "mallory", Payload::Empty);
        assert!(!keys.apply_incoming_key_update(&wrong_kind).await);
        assert!(!keys.has_keys("general"));
    }

    #[tokio::test]
    async fn persisted_keys_survive_restart() {
        let identity = Identity::generate();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = LocalStore::new();
        let broker = LocalBroker::new();
        let build = || {
            KeyManager::new(
                identity.clone(),
                db.clone(),
                CoordinationClient::new(Arc::new(store.clone()), "alice"),
                MailboxTransport::new(Arc::new(broker.clone()), "alice"),
                KeyFallback::TryKnownKeys,
            )
        };

        let first = build();
        first.transport.connect().await.unwrap();
        first
            .coord
            .claim_leader("general", Duration::from_secs(30))
            .await
            .unwrap();
        first.rotate("general").await.unwrap();
        let report = first.rotate("general").await.unwrap();

        let restarted = build();
        assert_eq!(restarted.load_persisted("general").await.unwrap(), 2);
        assert_eq!(
            restarted.keyring().active_key_id("general"),
            Some(report.key_id.as_str())
        );
    }

    #[test]
    fn fallback_policy_decides_unknown_key_ids() {
        let trying = manager(KeyFallback::TryKnownKeys);
        let strict = manager(KeyFallback::FailClosed);
        let key = ChannelKey::generate();
        for keys in [&trying, &strict] {
            keys.keyring_mut().insert("general", "k1", key.clone());
        }
        let ciphertext = encrypt_text(&key, "hello").unwrap();

        assert_eq!(
            trying.decrypt("general", None, &ciphertext).as_deref(),
            Some("hello")
        );
        assert_eq!(strict.decrypt("general", None, &ciphertext), None);
        assert_eq!(
            strict.decrypt("general", Some("k1"), &ciphertext).as_deref(),
            Some("hello")
        );

        // A wrong key is locked, never an error
        let other = encrypt_text(&ChannelKey::generate(), "secret").unwrap();
        assert_eq!(trying.decrypt("general", Some("k9"), &other), None);
        assert!(matches!(
            trying.resolve_decrypt_key("random", None),
            KeyResolution::Locked
        ));
    }
}
