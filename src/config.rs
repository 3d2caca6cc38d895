use serde::Deserialize;

use crate::message::IdMode;

/// Shared engine options, deserializable from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Disable in-flight tracking entirely: `finish`/`requeue` become cheap
    /// no-ops with respect to the ephemeral store and no sweeper runs.
    pub ephemeral_disabled: bool,
    /// Bound on in-flight count. -1 = unbounded.
    pub ephemeral_max_size: i64,
    /// When true, capacity violations raise `QueueIsFull` instead of
    /// returning `false` from `queue()`.
    pub strict_capacity: bool,
    /// How often the sweeper scans for orphans.
    pub sweep_interval_ms: u64,
    /// A reserved message older than this is presumed abandoned and rescued.
    /// Must exceed the expected maximum processing time.
    pub orphan_threshold_ms: u64,
    pub id_mode: IdMode,
}

impl QueueOptions {
    /// Matches the conventional consumer visibility timeout.
    pub const DEFAULT_ORPHAN_THRESHOLD_MS: u64 = 30_000;
    pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

    pub(crate) fn ephemeral_bound(&self) -> Option<usize> {
        usize::try_from(self.ephemeral_max_size).ok()
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            ephemeral_disabled: false,
            ephemeral_max_size: -1,
            strict_capacity: false,
            sweep_interval_ms: Self::DEFAULT_SWEEP_INTERVAL_MS,
            orphan_threshold_ms: Self::DEFAULT_ORPHAN_THRESHOLD_MS,
            id_mode: IdMode::Monotonic,
        }
    }
}

/// Options for the in-memory list engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// -1 = unbounded, N = reject inserts once length == N.
    pub boundary: i64,
}

impl MemoryConfig {
    pub(crate) fn bound(&self) -> Option<usize> {
        usize::try_from(self.boundary).ok()
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { boundary: -1 }
    }
}

/// Options for the ring-buffer engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Slot count; rounded up to the next power of two for mask indexing.
    pub ring_size: usize,
    pub producer_mode: ProducerMode,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring_size: 1024,
            producer_mode: ProducerMode::Multi,
        }
    }
}

/// How the publish cursor is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerMode {
    /// Plain increment; caller guarantees one producer thread.
    Single,
    /// Compare-and-swap claim loop; any number of producers.
    #[default]
    Multi,
}

/// Per-column-family tuning for the persistent engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub write_buffer_size: Option<usize>,
    pub max_write_buffer_number: Option<i32>,
    pub target_file_size_base: Option<u64>,
}
