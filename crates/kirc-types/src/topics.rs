//! Broker topic and coordination-store key naming.

// -- Broker topics --

pub fn inbox(user: &str) -> String {
    format!("inbox-{}", user)
}

/// Leader broadcast address: every channel member reads `out-{leader}`.
pub fn outbox(user: &str) -> String {
    format!("out-{}", user)
}

pub fn rpc_in(user: &str) -> String {
    format!("rpc-in-{}", user)
}

pub fn rpc_out(user: &str) -> String {
    format!("rpc-out-{}", user)
}

// -- Coordination keys --

pub fn leader_key(channel: &str) -> String {
    format!("channel:{}:leader", channel)
}

pub fn members_key(channel: &str) -> String {
    format!("channel:{}:members", channel)
}

pub fn channel_events(channel: &str) -> String {
    format!("channel:{}:events", channel)
}

pub fn presence(user: &str) -> String {
    format!("presence:{}", user)
}

pub fn typing_key(channel: &str, user: &str) -> String {
    format!("typing:{}:{}", channel, user)
}

pub fn typing_prefix(channel: &str) -> String {
    format!("typing:{}:", channel)
}

/// Pub/sub stream for typing changes in a channel.
pub fn typing(channel: &str) -> String {
    format!("typing:{}", channel)
}

pub fn rotation(channel: &str) -> String {
    format!("rotation:{}", channel)
}

pub fn notify(user: &str) -> String {
    format!("notify:{}", user)
}
