use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Core message envelope: immutable content plus mutable delivery metadata.
///
/// The wire format is a JSON mapping with fields `queue_id`, `org_timestamp`,
/// `timestamp`, `num_requeues` and `content`; `content` is binary and is
/// carried as base64 text because JSON is not binary-safe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    #[serde(rename = "queue_id")]
    pub id: Uuid,
    /// Set once at first enqueue; never changes afterwards.
    pub org_timestamp: u64,
    /// Refreshed every time the message is (re)placed into queue-visible
    /// state through the normal requeue path.
    pub timestamp: u64,
    /// Incremented only by `requeue()`; silent requeues and sweeper rescue
    /// leave it untouched.
    pub num_requeues: u32,
    #[serde(with = "content_base64")]
    pub content: Vec<u8>,
}

impl Message {
    /// Create a new message with both timestamps set to now.
    pub fn new(content: Vec<u8>, ids: &IdGenerator) -> Self {
        let now = now_millis();
        Self {
            id: ids.next_id(),
            org_timestamp: now,
            timestamp: now,
            num_requeues: 0,
            content,
        }
    }

    /// Bookkeeping for a normal retry: bump the requeue counter and refresh
    /// the visible timestamp.
    pub(crate) fn mark_requeued(&mut self) {
        self.num_requeues += 1;
        self.timestamp = now_millis();
    }

    /// Serialize to the JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::CannotSerializeMessage(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::CannotDeserializeMessage(e.to_string()))
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// How message ids are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdMode {
    /// Time-ordered UUIDv7 — ids sort by creation time.
    #[default]
    Monotonic,
    /// Random UUIDv4.
    Random,
}

/// Message id source, constructed once at process start and shared by handle
/// with every engine instance.
#[derive(Debug)]
pub struct IdGenerator {
    mode: IdMode,
    issued: AtomicU64,
}

impl IdGenerator {
    pub fn new(mode: IdMode) -> Self {
        Self {
            mode,
            issued: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> Uuid {
        self.issued.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            IdMode::Monotonic => Uuid::now_v7(),
            IdMode::Random => Uuid::new_v4(),
        }
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(IdMode::Monotonic)
    }
}

mod content_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        general_purpose::STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
