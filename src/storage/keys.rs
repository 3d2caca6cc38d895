//! Key encoding for the persistent engine's column families.
//!
//! Queue entries are keyed by a monotonically increasing insertion key so
//! that forward iteration over the column family yields FIFO order, and so
//! ordering survives a restart (the key embeds wall-clock time). All numeric
//! values use big-endian encoding for correct lexicographic ordering.

use std::sync::Mutex;

use uuid::Uuid;

/// Insertion key: 8-byte BE wall-clock millis followed by an 8-byte BE
/// sequence number that disambiguates entries created in the same
/// millisecond.
pub fn insertion_key(millis: u64, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&millis.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Decode an insertion key back into `(millis, seq)`.
pub fn parse_insertion_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 16 {
        return None;
    }
    let millis = u64::from_be_bytes(key[..8].try_into().ok()?);
    let seq = u64::from_be_bytes(key[8..].try_into().ok()?);
    Some((millis, seq))
}

/// Ephemeral marker key: the raw 16-byte message id.
pub fn ephemeral_key(id: &Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

/// Monotonic insertion-key source, one per engine instance.
///
/// A wall-clock step backwards must not reorder keys, so the generator never
/// lets the observed millis decrease within a process.
#[derive(Debug)]
pub struct KeyGenerator {
    state: Mutex<KeyState>,
}

#[derive(Debug)]
struct KeyState {
    last_millis: u64,
    seq: u64,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KeyState {
                last_millis: 0,
                seq: 0,
            }),
        }
    }

    pub fn next(&self, now_millis: u64) -> Vec<u8> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if now_millis > state.last_millis {
            state.last_millis = now_millis;
            state.seq = 0;
        } else {
            state.seq += 1;
        }
        insertion_key(state.last_millis, state.seq)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}
