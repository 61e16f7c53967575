mod config;
mod identity;

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use kirc_coord::ValkeyStore;
use kirc_crypto::Identity;
use kirc_crypto::keys::public_key_from_base64;
use kirc_db::Database;
use kirc_mailbox::KafkaBroker;
use kirc_relay::Relay;
use kirc_types::events::RelayEvent;
use kirc_types::models::{Contact, Profile};

use crate::config::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kirc=debug".into()),
        )
        .init();

    let config = NodeConfig::from_env()?;

    // Init database and identity
    let db = Arc::new(Database::open(&config.db_path)?);
    let identity = identity::load_or_create(&config.key_path)?;
    save_profile(&db, &config, &identity)?;

    let store = ValkeyStore::connect(&config.valkey_uri).await?;
    let broker = KafkaBroker::new(&config.kafka)?;
    let node = Relay::new(
        config.username.clone(),
        identity,
        db,
        Arc::new(store),
        Arc::new(broker),
        config.relay.clone(),
    );

    tokio::spawn(log_events(node.username().to_string(), node.events()));
    node.start().await?;

    let history = node.open_channel(&config.channel).await?;
    for message in &history {
        info!("[{}] <{}> {}", config.channel, message.sender, message.content);
    }

    info!("{} in {}, public key {}", config.username, config.channel, node.public_key_base64());
    info!("Commands: /msg, /trust, /ping, /who, /rotate, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !run_command(&node, &config.channel, line.trim()).await {
                    break;
                }
            }
        }
    }

    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}

fn save_profile(db: &Database, config: &NodeConfig, identity: &Identity) -> anyhow::Result<()> {
    let created_at = db
        .get_profile()?
        .filter(|profile| profile.username == config.username)
        .map_or_else(Utc::now, |profile| profile.created_at);
    db.save_profile(&Profile {
        username: config.username.clone(),
        display_name: config.display_name.clone(),
        public_key: Some(identity.public_key_base64()),
        status: "online".into(),
        created_at,
    })
}

/// Handle one line of input. Returns false to quit.
async fn run_command(node: &Relay, channel: &str, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let outcome = match command {
        "" => Ok(()),
        "/quit" => return false,
        "/msg" => match rest.split_once(' ') {
            Some((user, text)) => node.send_direct(user, text).await.map(|_| ()),
            None => {
                warn!("usage: /msg <user> <text>");
                Ok(())
            }
        },
        "/trust" => match rest.split_once(' ') {
            Some((user, key)) => match public_key_from_base64(key.trim()) {
                Ok(_) => node
                    .save_contact(Contact::new(user, "kafka").with_public_key(key.trim()))
                    .await
                    .map(|_| info!("Trusted {}", user)),
                Err(e) => Err(e.into()),
            },
            None => {
                warn!("usage: /trust <user> <public-key>");
                Ok(())
            }
        },
        "/ping" => node
            .ping(rest.trim())
            .await
            .map(|rtt| info!("{} answered in {:?}", rest.trim(), rtt)),
        "/who" => node.members(channel).await.map(|members| {
            let leader = node.leader_view(channel);
            info!(
                "{}: {:?} (leader {:?})",
                channel,
                members,
                leader.leader(node.username())
            );
        }),
        "/rotate" => node.rotate_channel_key(channel).await.map(|report| {
            info!(
                "Rotated {} to {} ({} delivered, skipped {:?})",
                report.channel, report.key_id, report.delivered, report.skipped
            )
        }),
        _ => node.send_chat(channel, line).await.map(|_| ()),
    };
    if let Err(e) = outcome {
        warn!("{}: {}", command, e);
    }
    true
}

async fn log_events(me: String, mut events: broadcast::Receiver<RelayEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("{} missed {} events", me, n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            RelayEvent::MessageRendered(msg) => {
                let channel = msg.channel.unwrap_or_default();
                info!("[{}] <{}> {}", channel, msg.sender, msg.content);
            }
            RelayEvent::DirectReceived(msg) => info!("*{}* {}", msg.sender, msg.content),
            RelayEvent::HistoryLoaded {
                channel,
                messages,
                is_encrypted,
            } => info!(
                "Loaded {} messages of {} (sealed: {})",
                messages.len(),
                channel,
                is_encrypted
            ),
            RelayEvent::PresenceUpdate { username, status } => {
                info!("{} is {}", username, status)
            }
            RelayEvent::TypingUpdate {
                channel,
                username,
                is_typing: true,
            } => info!("{} is typing in {}", username, channel),
            RelayEvent::TypingUpdate { .. } => {}
            RelayEvent::MembershipUpdate {
                channel,
                username,
                joined,
            } => info!(
                "{} {} {}",
                username,
                if joined { "joined" } else { "left" },
                channel
            ),
            RelayEvent::KeyRotated {
                channel,
                key_id,
                key_known,
            } => {
                if key_known {
                    info!("{} now uses key {}", channel, key_id)
                } else {
                    warn!("{} rotated to key {} which was not shared with {}", channel, key_id, me)
                }
            }
            RelayEvent::LeaderChanged { channel, leader } => {
                info!("Leader of {} is now {:?}", channel, leader)
            }
        }
    }
}
