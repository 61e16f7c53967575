//! Time-ordered 63-bit identifiers: 41 bits of milliseconds since
//! 2024-01-01T00:00:00Z, 10 bits of node id, 12 bits of sequence.

use std::sync::Mutex;

use sha2::{Digest, Sha256};

/// 2024-01-01 00:00:00 UTC in unix milliseconds.
pub const EPOCH_MS: i64 = 1_704_067_200_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

struct State {
    last_ms: i64,
    sequence: u64,
}

type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

pub struct SnowflakeGenerator {
    node_id: u64,
    clock: Clock,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    pub fn new(node_id: u16) -> Self {
        Self::with_clock(node_id, Box::new(|| chrono::Utc::now().timestamp_millis()))
    }

    /// Node id derived from a stable name (hostname, username).
    pub fn for_node(name: &str) -> Self {
        Self::new(node_id_for(name))
    }

    pub fn with_clock(node_id: u16, clock: Clock) -> Self {
        Self {
            node_id: node_id as u64 & NODE_MASK,
            clock,
            state: Mutex::new(State {
                last_ms: -1,
                sequence: 0,
            }),
        }
    }

    pub fn node_id(&self) -> u16 {
        self.node_id as u16
    }

    /// Never fails. If the clock steps back, ids keep counting from the
    /// last issued millisecond until the clock catches up.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let now = (self.clock)();

        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                if now == state.last_ms {
                    // Sequence exhausted for this millisecond
                    let mut next = now;
                    while next <= state.last_ms {
                        std::hint::spin_loop();
                        next = (self.clock)();
                    }
                    state.last_ms = next;
                } else {
                    state.last_ms += 1;
                }
            }
        }

        let elapsed = (state.last_ms - EPOCH_MS).max(0) as u64;
        let id = (elapsed << (NODE_BITS + SEQUENCE_BITS))
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence;
        id as i64
    }
}

/// Stable node id bits for a name: the low bits of its SHA-256 digest.
pub fn node_id_for(name: &str) -> u16 {
    let digest = Sha256::digest(name.as_bytes());
    (u16::from_be_bytes([digest[0], digest[1]]) as u64 & NODE_MASK) as u16
}

/// Milliseconds since the unix epoch encoded in a snowflake id.
pub fn timestamp_ms(id: i64) -> i64 {
    ((id as u64) >> (NODE_BITS + SEQUENCE_BITS)) as i64 + EPOCH_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn fixed_clock(start: i64) -> (Arc<AtomicI64>, Clock) {
        let now = Arc::new(AtomicI64::new(start));
        let handle = now.clone();
        (now, Box::new(move || handle.load(Ordering::SeqCst)))
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = SnowflakeGenerator::new(7);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn layout_carries_node_and_time() {
        let (_, clock) = fixed_clock(EPOCH_MS + 5_000);
        let generator = SnowflakeGenerator::with_clock(3, clock);
        let id = generator.next_id();

        assert_eq!(timestamp_ms(id), EPOCH_MS + 5_000);
        assert_eq!((id >> SEQUENCE_BITS) as u64 & NODE_MASK, 3);
    }

    #[test]
    fn backward_clock_keeps_ids_increasing() {
        let (now, clock) = fixed_clock(EPOCH_MS + 10_000);
        let generator = SnowflakeGenerator::with_clock(1, clock);
        let before = generator.next_id();

        now.store(EPOCH_MS + 9_000, Ordering::SeqCst);
        let during = generator.next_id();
        assert!(during > before);
        assert_eq!(timestamp_ms(during), EPOCH_MS + 10_000);

        // Exhausting the sequence while behind borrows the next millisecond
        let mut last = during;
        for _ in 0..SEQUENCE_MASK {
            let id = generator.next_id();
            assert!(id > last);
            last = id;
        }
        assert_eq!(timestamp_ms(last), EPOCH_MS + 10_001);

        now.store(EPOCH_MS + 12_000, Ordering::SeqCst);
        let after = generator.next_id();
        assert!(after > last);
        assert_eq!(timestamp_ms(after), EPOCH_MS + 12_000);
    }

    #[test]
    fn node_ids_are_stable_for_a_name() {
        // First two digest bytes of sha256("alice") are 0x2b 0xd8
        assert_eq!(node_id_for("alice"), 0x2bd8 & NODE_MASK as u16);
        assert_eq!(SnowflakeGenerator::for_node("alice").node_id(), node_id_for("alice"));
        assert_ne!(node_id_for("alice"), node_id_for("bob"));
    }

    #[test]
    fn sequence_counts_within_a_millisecond() {
        let (_, clock) = fixed_clock(EPOCH_MS + 1);
        let generator = SnowflakeGenerator::with_clock(0, clock);
        let first = generator.next_id();
        let second = generator.next_id();
        assert_eq!(second - first, 1);
    }
}
