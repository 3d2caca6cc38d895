//! Pluggable reliable queue engine.
//!
//! One contract — [`Queue`] — with at-least-once delivery semantics, backed
//! by interchangeable storage engines: a mutex-guarded in-memory list
//! ([`MemoryQueue`]), a lock-minimized ring buffer ([`RingQueue`]), and a
//! durable engine over an embedded ordered key-value store
//! ([`PersistentQueue`]). Messages taken for processing move into a
//! concurrent ephemeral store; a background sweeper returns abandoned
//! reservations to the queue, which is what makes delivery at-least-once in
//! the presence of consumer crashes.

pub mod config;
pub mod engine;
pub mod ephemeral;
pub mod error;
pub mod message;
pub mod queue;
pub mod storage;
mod sweeper;
pub mod telemetry;

pub use config::{MemoryConfig, ProducerMode, QueueOptions, RingConfig, StoreOptions};
pub use engine::{MemoryQueue, PersistentQueue, RingQueue};
pub use ephemeral::{EphemeralRecord, EphemeralStore};
pub use error::{QueueError, Result, StorageError, StorageResult};
pub use message::{IdGenerator, IdMode, Message};
pub use queue::Queue;
pub use storage::QueueStore;
