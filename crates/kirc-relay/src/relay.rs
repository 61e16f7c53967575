use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use kirc_coord::{CoordHandler, CoordinationClient, KeyValueStore};
use kirc_crypto::keys::public_key_from_base64;
use kirc_crypto::{Identity, open, seal};
use kirc_db::Database;
use kirc_mailbox::{Broker, MailboxTransport, MessageHandler};
use kirc_types::events::{
    CoordEvent, CoordEventKind, DisplayMessage, MembershipAction, RelayEvent,
};
use kirc_types::models::{Channel, Contact, HistoryEntry, StoredMessage};
use kirc_types::snowflake::SnowflakeGenerator;
use kirc_types::{Envelope, KircError, MessageType, Payload, Result, topics};

use crate::config::RelayConfig;
use crate::history;
use crate::keys::{KeyManager, RotationReport};
use crate::leader::LeaderView;
use crate::store::with_db;

/// Shown in place of channel content no known key can open.
pub const LOCKED_PLACEHOLDER: &str = "[locked: missing channel key]";

const MAX_HISTORY_PAGE: u32 = 500;

/// The relay node: leader-based fan-out, history sync, key distribution
/// and direct messages for one identity. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    username: String,
    identity: Identity,
    config: RelayConfig,
    db: Arc<Database>,
    coord: CoordinationClient,
    transport: MailboxTransport,
    keys: KeyManager,
    ids: SnowflakeGenerator,

    /// Presentation events for the host
    events: broadcast::Sender<RelayEvent>,

    leaders: RwLock<HashMap<String, LeaderView>>,
    /// channel -> leader whose outbox is read for it
    following: Mutex<HashMap<String, String>>,
    joined: RwLock<BTreeSet<String>>,
    open_channel: RwLock<Option<String>>,

    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(
        username: impl Into<String>,
        identity: Identity,
        db: Arc<Database>,
        store: Arc<dyn KeyValueStore>,
        broker: Arc<dyn Broker>,
        config: RelayConfig,
    ) -> Self {
        let username = username.into();
        let coord = CoordinationClient::new(store, username.clone());
        let transport = MailboxTransport::new(broker, username.clone());
        let keys = KeyManager::new(
            identity.clone(),
            db.clone(),
            coord.clone(),
            transport.clone(),
            config.key_fallback,
        );
        let (events, _) = broadcast::channel(1024);

        let inner = Arc::new(RelayInner {
            ids: SnowflakeGenerator::for_node(&username),
            username,
            identity,
            config,
            db,
            coord,
            transport,
            keys,
            events,
            leaders: RwLock::new(HashMap::new()),
            following: Mutex::new(HashMap::new()),
            joined: RwLock::new(BTreeSet::new()),
            open_channel: RwLock::new(None),
            heartbeat: Mutex::new(None),
        });

        let dispatch = Arc::new(Dispatch(Arc::downgrade(&inner)));
        for kind in [MessageType::Chat, MessageType::Direct] {
            inner.transport.on_message(kind, dispatch.clone());
        }
        for kind in [
            MessageType::FetchHistory,
            MessageType::ChannelKeyUpdate,
            MessageType::Ping,
        ] {
            inner.transport.on_rpc(kind, dispatch.clone());
        }
        for kind in [
            CoordEventKind::Presence,
            CoordEventKind::Typing,
            CoordEventKind::Rotation,
            CoordEventKind::Membership,
            CoordEventKind::Notification,
        ] {
            inner.coord.on(kind, dispatch.clone());
        }

        Self { inner }
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    pub fn public_key_base64(&self) -> String {
        self.inner.identity.public_key_base64()
    }

    pub fn keys(&self) -> &KeyManager {
        &self.inner.keys
    }

    pub fn coordination(&self) -> &CoordinationClient {
        &self.inner.coord
    }

    pub fn transport(&self) -> &MailboxTransport {
        &self.inner.transport
    }

    pub fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    // -- Lifecycle --

    /// Connect both backing services, announce presence, rejoin the
    /// channels marked joined in the local store and start the heartbeat.
    pub async fn start(&self) -> Result<()> {
        let me = &self.inner.username;
        self.inner.transport.connect().await?;
        self.inner.coord.connect().await?;
        self.inner
            .coord
            .set_presence("online", self.inner.config.presence_ttl)
            .await?;

        let channels = with_db(&self.inner.db, |db| db.get_channels(true)).await?;
        for channel in channels {
            if let Err(e) = self.join_channel(&channel.name).await {
                warn!("{} could not rejoin {}: {}", me, channel.name, e);
            }
        }

        self.spawn_heartbeat();
        info!("{} relay started ({})", me, self.inner.identity.fingerprint());
        Ok(())
    }

    /// Resign held leases, go offline and disconnect.
    pub async fn shutdown(&self) {
        if let Some(task) = lock(&self.inner.heartbeat).take() {
            task.abort();
        }

        let held: Vec<String> = read_lock(&self.inner.leaders)
            .iter()
            .filter(|(_, view)| view.is_self())
            .map(|(channel, _)| channel.clone())
            .collect();
        for channel in held {
            if let Err(e) = self.inner.coord.resign_leader(&channel).await {
                warn!("Could not resign {}: {}", channel, e);
            }
            self.set_view(&channel, LeaderView::Unknown);
        }

        self.inner.coord.disconnect().await;
        self.inner.transport.disconnect().await;
        info!("{} relay stopped", self.inner.username);
    }

    fn spawn_heartbeat(&self) {
        let relay = Arc::downgrade(&self.inner);
        let period = self.inner.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = relay.upgrade() else {
                    break;
                };
                Relay { inner }.heartbeat().await;
            }
        });
        if let Some(old) = lock(&self.inner.heartbeat).replace(task) {
            old.abort();
        }
    }

    /// One heartbeat pass: refresh presence, renew held leases, and look up
    /// the leader of every other joined channel, claiming it if the lease
    /// has expired.
    pub async fn heartbeat(&self) {
        let coord = &self.inner.coord;
        let presence_ttl = self.inner.config.presence_ttl;
        match coord.refresh_presence(presence_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = coord.set_presence("online", presence_ttl).await {
                    warn!("Could not restore presence: {}", e);
                }
            }
            Err(e) => warn!("Presence refresh failed: {}", e),
        }

        let joined: Vec<String> = read_lock(&self.inner.joined).iter().cloned().collect();
        for channel in joined {
            let outcome = if self.leader_view(&channel).is_self() {
                self.renew_lease(&channel).await
            } else {
                self.ensure_leader(&channel).await.map(|_| ())
            };
            if let Err(e) = outcome {
                warn!("Heartbeat for {} failed: {}", channel, e);
            }
        }
    }

    async fn renew_lease(&self, channel: &str) -> Result<()> {
        let renewed = self
            .inner
            .coord
            .claim_leader(channel, self.inner.config.lease_ttl)
            .await?;
        if renewed {
            return Ok(());
        }

        warn!("{} lost leadership of {}", self.inner.username, channel);
        let leader = self.inner.coord.get_leader(channel).await?;
        self.observe_leader(channel, leader.as_deref()).await;
        Ok(())
    }

    // -- Channels --

    pub async fn join_channel(&self, channel: &str) -> Result<()> {
        let coord = &self.inner.coord;
        coord.join(channel).await?;
        write_lock(&self.inner.joined).insert(channel.to_string());

        let name = channel.to_string();
        with_db(&self.inner.db, move |db| {
            let description = db.get_channel(&name)?.and_then(|c| c.description);
            db.save_channel(&Channel {
                name,
                description,
                is_joined: true,
                created_at: Utc::now(),
            })
        })
        .await?;

        self.inner.keys.load_persisted(channel).await?;
        coord.subscribe_typing(channel).await?;
        coord.subscribe_rotation(channel).await?;
        coord.subscribe_channel_events(channel).await?;

        let leader = self.ensure_leader(channel).await?;
        info!("{} joined {} (leader {})", self.inner.username, channel, leader);
        Ok(())
    }

    pub async fn leave_channel(&self, channel: &str) -> Result<()> {
        let coord = &self.inner.coord;
        if self.leader_view(channel).is_self() {
            coord.resign_leader(channel).await?;
        }
        coord.leave(channel).await?;
        coord.unsubscribe_typing(channel).await?;
        coord.unsubscribe_rotation(channel).await?;
        coord.unsubscribe_channel_events(channel).await?;
        self.unfollow(channel).await;

        write_lock(&self.inner.joined).remove(channel);
        write_lock(&self.inner.leaders).remove(channel);
        {
            let mut open = write_lock(&self.inner.open_channel);
            if open.as_deref() == Some(channel) {
                *open = None;
            }
        }

        let name = channel.to_string();
        with_db(&self.inner.db, move |db| {
            if let Some(mut stored) = db.get_channel(&name)? {
                stored.is_joined = false;
                db.save_channel(&stored)?;
            }
            Ok(())
        })
        .await?;

        info!("{} left {}", self.inner.username, channel);
        Ok(())
    }

    /// Make `channel` the rendered channel and load its history from the
    /// leader.
    pub async fn open_channel(&self, channel: &str) -> Result<Vec<DisplayMessage>> {
        if !self.is_joined(channel) {
            self.join_channel(channel).await?;
        }
        *write_lock(&self.inner.open_channel) = Some(channel.to_string());

        let name = channel.to_string();
        with_db(&self.inner.db, move |db| db.mark_channel_read(&name)).await?;

        self.fetch_history(channel).await
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        read_lock(&self.inner.joined).contains(channel)
    }

    pub fn joined_channels(&self) -> BTreeSet<String> {
        read_lock(&self.inner.joined).clone()
    }

    pub fn open_channel_name(&self) -> Option<String> {
        read_lock(&self.inner.open_channel).clone()
    }

    pub async fn members(&self, channel: &str) -> Result<BTreeSet<String>> {
        self.inner.coord.members(channel).await
    }

    // -- Leadership --

    pub fn leader_view(&self, channel: &str) -> LeaderView {
        read_lock(&self.inner.leaders)
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    fn set_view(&self, channel: &str, view: LeaderView) -> Option<LeaderView> {
        write_lock(&self.inner.leaders).insert(channel.to_string(), view)
    }

    /// Resolve the channel's leader, claiming the lease when there is none.
    /// A fresh claim also originates a channel key if the channel has none.
    pub async fn ensure_leader(&self, channel: &str) -> Result<String> {
        let me = self.inner.username.as_str();
        let coord = &self.inner.coord;

        if let Some(leader) = coord.get_leader(channel).await? {
            self.observe_leader(channel, Some(&leader)).await;
            return Ok(leader);
        }

        let before = self.set_view(channel, LeaderView::Claiming);
        let claimed = match coord.claim_leader(channel, self.inner.config.lease_ttl).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.set_view(channel, before.unwrap_or_default());
                return Err(e);
            }
        };

        if claimed {
            self.observe_leader(channel, Some(me)).await;
            if !self.inner.keys.has_keys(channel) {
                match self.inner.keys.rotate(channel).await {
                    Ok(report) => debug!("Originated key {} for {}", report.key_id, channel),
                    Err(e) => warn!("Could not originate a key for {}: {}", channel, e),
                }
            }
            return Ok(me.to_string());
        }

        // Lost the race: read the winner
        let leader = coord.get_leader(channel).await?;
        self.observe_leader(channel, leader.as_deref()).await;
        leader.ok_or_else(|| KircError::NoLeader(channel.to_string()))
    }

    async fn observe_leader(&self, channel: &str, leader: Option<&str>) {
        let view = LeaderView::from_lookup(&self.inner.username, leader);
        let previous = self.set_view(channel, view.clone());
        if previous.as_ref() == Some(&view) {
            return;
        }

        match &view {
            LeaderView::LeaderOther(leader) => self.follow(channel, leader).await,
            _ => self.unfollow(channel).await,
        }

        info!("{}: leader of {} is {:?}", self.inner.username, channel, leader);
        self.emit(RelayEvent::LeaderChanged {
            channel: channel.to_string(),
            leader: leader.map(str::to_string),
        });
    }

    async fn follow(&self, channel: &str, leader: &str) {
        let previous = lock(&self.inner.following).insert(channel.to_string(), leader.to_string());
        if previous.as_deref() == Some(leader) {
            return;
        }
        if let Err(e) = self.inner.transport.subscribe(&topics::outbox(leader)).await {
            warn!("Could not follow {} for {}: {}", leader, channel, e);
        }
        if let Some(previous) = previous {
            self.release_outbox(&previous).await;
        }
    }

    async fn unfollow(&self, channel: &str) {
        let previous = lock(&self.inner.following).remove(channel);
        if let Some(previous) = previous {
            self.release_outbox(&previous).await;
        }
    }

    /// Stop reading a leader's outbox unless another channel still needs it.
    async fn release_outbox(&self, leader: &str) {
        let still_followed = lock(&self.inner.following)
            .values()
            .any(|followed| followed == leader);
        if still_followed {
            return;
        }
        if let Err(e) = self.inner.transport.unsubscribe(&topics::outbox(leader)).await {
            warn!("Could not unfollow {}: {}", leader, e);
        }
    }

    // -- Channel messages --

    /// Send to a channel: the leader publishes to its own outbox, anyone
    /// else hands the message to the leader's inbox.
    pub async fn send_chat(&self, channel: &str, text: &str) -> Result<Envelope> {
        let me = self.inner.username.as_str();
        if !self.is_joined(channel) {
            return Err(KircError::Authorization {
                user: me.to_string(),
                action: format!("send to {} without joining", channel),
            });
        }

        let leader = self.ensure_leader(channel).await?;
        let payload = self.inner.keys.encrypt_outbound(channel, text)?;
        let envelope = Envelope::new(MessageType::Chat, me, payload).in_channel(channel);

        if leader == me {
            self.inner.transport.send(&envelope, None).await?;
            self.record_channel_message(&envelope, text.to_string(), false)
                .await;
        } else {
            self.inner
                .transport
                .send(&envelope, Some(&topics::inbox(&leader)))
                .await?;
            trace!("{} handed {} to leader {}", me, envelope.id, leader);
        }
        Ok(envelope)
    }

    async fn on_channel_message(&self, envelope: &Envelope) -> Result<()> {
        let me = self.inner.username.as_str();
        let Some(channel) = envelope.channel.as_deref() else {
            return Err(KircError::Malformed(format!(
                "{} {} has no channel",
                envelope.kind, envelope.id
            )));
        };
        if !self.is_joined(channel) {
            debug!("Ignoring {} for unjoined channel {}", envelope.id, channel);
            return Ok(());
        }

        let (content, locked) = match &envelope.payload {
            Payload::Text { content } => (content.clone(), false),
            Payload::Encrypted { ciphertext, key_id } => {
                match self.inner.keys.decrypt(channel, key_id.as_deref(), ciphertext) {
                    Some(text) => (text, false),
                    None => {
                        warn!(
                            "No key opens {} in {} (key {:?})",
                            envelope.id, channel, key_id
                        );
                        (LOCKED_PLACEHOLDER.to_string(), true)
                    }
                }
            }
            other => {
                return Err(KircError::Malformed(format!(
                    "unexpected channel payload {:?}",
                    other
                )));
            }
        };
        self.record_channel_message(envelope, content, locked).await;

        // Relay only what others sent; a leader never reads its own outbox
        if envelope.sender != me && self.leader_view(channel).is_self() {
            self.inner.transport.send(envelope, None).await?;
            trace!("Relayed {} from {} in {}", envelope.id, envelope.sender, channel);
        }
        Ok(())
    }

    async fn record_channel_message(&self, envelope: &Envelope, content: String, locked: bool) {
        let channel = envelope.channel.clone();
        let is_open = channel.is_some() && self.open_channel_name() == channel;
        let display = DisplayMessage {
            id: envelope.id.to_string(),
            channel,
            sender: envelope.sender.clone(),
            content: content.clone(),
            timestamp: envelope.timestamp,
            locked,
        };

        self.persist(envelope, content, is_open).await;
        if is_open {
            self.emit(RelayEvent::MessageRendered(display));
        }
    }

    async fn persist(&self, envelope: &Envelope, content: String, is_read: bool) {
        let message = StoredMessage {
            id: self.inner.ids.next_id(),
            message_id: envelope.id.to_string(),
            kind: envelope.kind,
            sender: envelope.sender.clone(),
            recipient: envelope.recipient.clone(),
            channel: envelope.channel.clone(),
            content,
            timestamp: envelope.timestamp,
            is_outbound: envelope.sender == self.inner.username,
            is_read,
        };

        match with_db(&self.inner.db, move |db| db.save_message(&message)).await {
            Ok(true) => {}
            Ok(false) => trace!("{} already stored", envelope.id),
            Err(e) => warn!("Could not store {}: {}", envelope.id, e),
        }
    }

    /// Locally stored channel messages, oldest first.
    pub async fn channel_messages(&self, channel: &str, limit: u32) -> Result<Vec<StoredMessage>> {
        let name = channel.to_string();
        with_db(&self.inner.db, move |db| db.get_channel_messages(&name, limit)).await
    }

    // -- History sync --

    /// Fetch recent history from the channel leader and store it locally.
    pub async fn fetch_history(&self, channel: &str) -> Result<Vec<DisplayMessage>> {
        let me = self.inner.username.as_str();
        let limit = self.inner.config.history_limit;
        let leader = self.ensure_leader(channel).await?;

        let (entries, is_encrypted) = if leader == me {
            let stored = self.channel_messages(channel, limit).await?;
            let entries: Vec<HistoryEntry> =
                stored.iter().map(StoredMessage::to_history_entry).collect();
            (entries, true)
        } else {
            let request = Envelope::new(
                MessageType::FetchHistory,
                me,
                Payload::FetchHistory {
                    channel: channel.to_string(),
                    limit,
                },
            )
            .in_channel(channel)
            .to(leader.as_str());
            let response = self
                .inner
                .transport
                .request(request, &topics::rpc_in(&leader), self.inner.config.rpc_timeout)
                .await?;
            let (entries, is_encrypted) = self.read_history_page(channel, response)?;
            self.store_history(channel, &entries).await;
            (entries, is_encrypted)
        };

        let messages: Vec<DisplayMessage> = entries
            .iter()
            .map(|entry| display_entry(channel, entry))
            .collect();
        debug!("Loaded {} history messages for {}", messages.len(), channel);
        self.emit(RelayEvent::HistoryLoaded {
            channel: channel.to_string(),
            messages: messages.clone(),
            is_encrypted,
        });
        Ok(messages)
    }

    fn read_history_page(
        &self,
        channel: &str,
        response: Envelope,
    ) -> Result<(Vec<HistoryEntry>, bool)> {
        match response.payload {
            Payload::HistoryData {
                is_encrypted: true,
                sealed_page: Some(sealed_page),
                ..
            } => Ok((history::open_page(&self.inner.identity, &sealed_page)?, true)),
            Payload::HistoryData {
                is_encrypted: false,
                entries,
                ..
            } => {
                warn!(
                    "History for {} arrived unencrypted from {}",
                    channel, response.sender
                );
                Ok((entries, false))
            }
            other => Err(KircError::Malformed(format!(
                "unexpected history response {:?}",
                other
            ))),
        }
    }

    async fn store_history(&self, channel: &str, entries: &[HistoryEntry]) {
        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            messages.push(StoredMessage {
                id: self.inner.ids.next_id(),
                message_id: entry.id.clone(),
                kind: MessageType::Chat,
                sender: entry.sender.clone(),
                recipient: None,
                channel: Some(channel.to_string()),
                content: entry.content.clone(),
                timestamp: entry.timestamp(),
                is_outbound: entry.sender == self.inner.username,
                is_read: true,
            });
        }

        let stored = with_db(&self.inner.db, move |db| {
            let mut stored = 0;
            for message in &messages {
                if db.save_message(message)? {
                    stored += 1;
                } else if message.content != LOCKED_PLACEHOLDER {
                    // The leader could read what arrived here locked
                    db.replace_placeholder(&message.message_id, LOCKED_PLACEHOLDER, &message.content)?;
                }
            }
            Ok(stored)
        })
        .await;
        match stored {
            Ok(count) => trace!("Stored {} new history messages for {}", count, channel),
            Err(e) => warn!("Could not store history for {}: {}", channel, e),
        }
    }

    /// Answer a history request from the local store. The page is sealed to
    /// the requester when its public key is on file, and sent in the clear
    /// with `is_encrypted = false` otherwise.
    async fn serve_history(&self, envelope: &Envelope) -> Result<()> {
        let Payload::FetchHistory { channel, limit } = &envelope.payload else {
            return Err(KircError::Malformed("fetch_history without a request".into()));
        };
        let requester = envelope.sender.clone();
        let limit = (*limit).clamp(1, MAX_HISTORY_PAGE);

        let (name, contact) = (channel.clone(), requester.clone());
        let (stored, public_key) = with_db(&self.inner.db, move |db| {
            let stored = db.get_channel_messages(&name, limit)?;
            let public_key = db.get_contact(&contact)?.and_then(|c| c.public_key);
            Ok((stored, public_key))
        })
        .await?;
        let entries: Vec<HistoryEntry> = stored.iter().map(StoredMessage::to_history_entry).collect();

        let payload = match public_key.map(|key| public_key_from_base64(&key)) {
            Some(Ok(public_key)) => {
                let (sealed_page, kept) = history::seal_page(&public_key, &entries)?;
                debug!(
                    "Serving {} of {} history entries of {} sealed to {}",
                    kept,
                    entries.len(),
                    channel,
                    requester
                );
                Payload::HistoryData {
                    channel: channel.clone(),
                    is_encrypted: true,
                    entries: Vec::new(),
                    sealed_page: Some(sealed_page),
                }
            }
            invalid => {
                if let Some(Err(e)) = invalid {
                    warn!("Stored public key of {} is unusable: {}", requester, e);
                }
                debug!(
                    "No public key for {}, serving {} in the clear",
                    requester, channel
                );
                Payload::HistoryData {
                    channel: channel.clone(),
                    is_encrypted: false,
                    entries,
                    sealed_page: None,
                }
            }
        };

        let reply = envelope.reply(MessageType::HistoryData, self.inner.username.as_str(), payload);
        self.inner
            .transport
            .send_rpc(&reply, Some(&topics::rpc_in(&requester)))
            .await
    }

    // -- Keys --

    /// Issue a new channel key. Only the channel leader may rotate.
    pub async fn rotate_channel_key(&self, channel: &str) -> Result<RotationReport> {
        self.inner.keys.rotate(channel).await
    }

    async fn on_key_update(&self, envelope: &Envelope) {
        if !self.inner.keys.apply_incoming_key_update(envelope).await {
            return;
        }
        if let Payload::ChannelKeyUpdate {
            channel, key_id, ..
        } = &envelope.payload
        {
            self.emit(RelayEvent::KeyRotated {
                channel: channel.clone(),
                key_id: key_id.clone(),
                key_known: true,
            });
        }
    }

    // -- Direct messages --

    pub async fn save_contact(&self, contact: Contact) -> Result<()> {
        with_db(&self.inner.db, move |db| db.save_contact(&contact)).await
    }

    /// Send a direct message to `user`'s inbox, sealed to their public key
    /// when one is on file. Text too long to seal is refused with
    /// `PayloadTooLarge`; only contacts without a key get plaintext.
    pub async fn send_direct(&self, user: &str, text: &str) -> Result<Envelope> {
        let name = user.to_string();
        let public_key = with_db(&self.inner.db, move |db| {
            Ok(db.get_contact(&name)?.and_then(|c| c.public_key))
        })
        .await?;

        let payload = match public_key {
            Some(public_key) => {
                let public_key = public_key_from_base64(&public_key)?;
                Payload::Sealed {
                    ciphertext: BASE64.encode(seal(&public_key, text.as_bytes())?),
                }
            }
            _ => Payload::Text {
                content: text.to_string(),
            },
        };

        let envelope =
            Envelope::new(MessageType::Direct, self.inner.username.as_str(), payload).to(user);
        self.inner
            .transport
            .send(&envelope, Some(&topics::inbox(user)))
            .await?;
        self.persist(&envelope, text.to_string(), true).await;
        Ok(envelope)
    }

    async fn on_direct(&self, envelope: &Envelope) -> Result<()> {
        let sender = envelope.sender.clone();
        let contact = with_db(&self.inner.db, move |db| db.get_contact(&sender)).await?;
        if contact.is_some_and(|c| c.is_blocked) {
            debug!("Dropping direct message from blocked {}", envelope.sender);
            return Ok(());
        }

        let (content, locked) = match &envelope.payload {
            Payload::Text { content } => (content.clone(), false),
            Payload::Sealed { ciphertext } => match self.open_direct(ciphertext) {
                Ok(text) => (text, false),
                Err(e) => {
                    warn!("Cannot open direct message {}: {}", envelope.id, e);
                    (LOCKED_PLACEHOLDER.to_string(), true)
                }
            },
            other => {
                return Err(KircError::Malformed(format!(
                    "unexpected direct payload {:?}",
                    other
                )));
            }
        };

        self.persist(envelope, content.clone(), false).await;
        self.emit(RelayEvent::DirectReceived(DisplayMessage {
            id: envelope.id.to_string(),
            channel: None,
            sender: envelope.sender.clone(),
            content,
            timestamp: envelope.timestamp,
            locked,
        }));
        Ok(())
    }

    fn open_direct(&self, ciphertext: &str) -> Result<String> {
        let sealed = BASE64
            .decode(ciphertext)
            .map_err(|e| KircError::Malformed(e.to_string()))?;
        let plaintext = open(&self.inner.identity, &sealed)?;
        String::from_utf8(plaintext).map_err(|e| KircError::Malformed(e.to_string()))
    }

    /// Direct messages exchanged with a contact, oldest first.
    pub async fn contact_messages(&self, user: &str, limit: u32) -> Result<Vec<StoredMessage>> {
        let name = user.to_string();
        with_db(&self.inner.db, move |db| db.get_contact_messages(&name, limit)).await
    }

    // -- Presence and typing --

    pub async fn set_status(&self, status: &str) -> Result<()> {
        self.inner
            .coord
            .set_presence(status, self.inner.config.presence_ttl)
            .await
    }

    pub async fn watch_presence(&self, user: &str) -> Result<()> {
        self.inner.coord.subscribe_presence(user).await
    }

    pub async fn set_typing(&self, channel: &str, is_typing: bool) -> Result<()> {
        self.inner
            .coord
            .set_typing(channel, is_typing, self.inner.config.typing_ttl)
            .await
    }

    pub async fn typing_users(&self, channel: &str) -> Result<BTreeSet<String>> {
        self.inner.coord.get_typing_users(channel).await
    }

    // -- RPC --

    /// Round trip time of a ping answered by `user`.
    pub async fn ping(&self, user: &str) -> Result<Duration> {
        let started = tokio::time::Instant::now();
        let request =
            Envelope::new(MessageType::Ping, self.inner.username.as_str(), Payload::Empty).to(user);
        let response = self
            .inner
            .transport
            .request(request, &topics::rpc_in(user), self.inner.config.rpc_timeout)
            .await?;
        if response.kind != MessageType::Pong {
            return Err(KircError::Malformed(format!(
                "expected pong, got {}",
                response.kind
            )));
        }
        Ok(started.elapsed())
    }

    async fn answer_ping(&self, envelope: &Envelope) -> Result<()> {
        let pong = envelope.reply(MessageType::Pong, self.inner.username.as_str(), Payload::Empty);
        self.inner
            .transport
            .send_rpc(&pong, Some(&topics::rpc_in(&envelope.sender)))
            .await
    }

    // -- Coordination events --

    async fn on_coord_event(&self, event: &CoordEvent) -> Result<()> {
        let me = self.inner.username.as_str();
        match event {
            CoordEvent::Presence(presence) => self.emit(RelayEvent::PresenceUpdate {
                username: presence.username.clone(),
                status: presence.status.clone(),
            }),
            CoordEvent::Typing(typing) => {
                if typing.username != me {
                    self.emit(RelayEvent::TypingUpdate {
                        channel: typing.channel.clone(),
                        username: typing.username.clone(),
                        is_typing: typing.is_typing,
                    });
                }
            }
            CoordEvent::Membership(change) => {
                let joined = change.action == MembershipAction::Join;
                self.emit(RelayEvent::MembershipUpdate {
                    channel: change.channel.clone(),
                    username: change.username.clone(),
                    joined,
                });
                // Late joiners get the active key from the leader
                if joined && change.username != me && self.leader_view(&change.channel).is_self() {
                    self.inner
                        .keys
                        .share_active(&change.channel, &change.username)
                        .await?;
                }
            }
            CoordEvent::Rotation(rotation) => {
                let key_known = self
                    .inner
                    .keys
                    .keyring()
                    .contains(&rotation.channel, &rotation.key_id);
                self.emit(RelayEvent::KeyRotated {
                    channel: rotation.channel.clone(),
                    key_id: rotation.key_id.clone(),
                    key_known,
                });
            }
            CoordEvent::Notification(note) => {
                info!("Notification from {} ({}): {}", note.sender, note.kind, note.body);
            }
        }
        Ok(())
    }

    fn emit(&self, event: RelayEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }
}

fn display_entry(channel: &str, entry: &HistoryEntry) -> DisplayMessage {
    DisplayMessage {
        id: entry.id.clone(),
        channel: Some(channel.to_string()),
        sender: entry.sender.clone(),
        content: entry.content.clone(),
        timestamp: entry.timestamp(),
        locked: entry.content == LOCKED_PLACEHOLDER,
    }
}

/// Routes transport and coordination callbacks into the relay.
struct Dispatch(Weak<RelayInner>);

impl Dispatch {
    fn relay(&self) -> Option<Relay> {
        self.0.upgrade().map(|inner| Relay { inner })
    }
}

#[async_trait]
impl MessageHandler for Dispatch {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let Some(relay) = self.relay() else {
            return Ok(());
        };
        match envelope.kind {
            MessageType::Chat => relay.on_channel_message(envelope).await,
            MessageType::Direct => relay.on_direct(envelope).await,
            MessageType::FetchHistory => relay.serve_history(envelope).await,
            MessageType::ChannelKeyUpdate => {
                relay.on_key_update(envelope).await;
                Ok(())
            }
            MessageType::Ping => relay.answer_ping(envelope).await,
            other => {
                debug!("Unrouted {} from {}", other, envelope.sender);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CoordHandler for Dispatch {
    async fn handle(&self, event: &CoordEvent) -> Result<()> {
        match self.relay() {
            Some(relay) => relay.on_coord_event(event).await,
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
