use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::message::Message;

/// A message currently checked out for processing.
#[derive(Debug, Clone)]
pub struct EphemeralRecord {
    pub message: Message,
    /// Wall-clock millis at reservation time.
    pub reserved_at: u64,
}

/// Concurrent in-flight tracking, keyed by message id.
///
/// The sweeper scans while consumers insert and remove, so the map must not
/// sit behind a single lock. Admission is two-phase: `try_reserve` claims a
/// slot against the bound before the backing store gives up the message, and
/// `commit` (or `cancel`) resolves the claim. This keeps the pop-from-queued
/// / insert-into-ephemeral pairing from over-admitting under concurrency.
pub struct EphemeralStore {
    records: DashMap<Uuid, EphemeralRecord>,
    len: AtomicUsize,
    max: Option<usize>,
    disabled: bool,
}

impl EphemeralStore {
    pub fn new(disabled: bool, max: Option<usize>) -> Self {
        Self {
            records: DashMap::new(),
            len: AtomicUsize::new(0),
            max,
            disabled,
        }
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Claim a slot ahead of a `take()`. Returns `Ok(false)` when tracking
    /// is disabled (the caller proceeds without a commit), `Ok(true)` when a
    /// slot was claimed, and `EphemeralIsFull` at the bound.
    pub fn try_reserve(&self) -> Result<bool> {
        if self.disabled {
            return Ok(false);
        }
        if let Some(max) = self.max {
            let claimed = self
                .len
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                });
            if claimed.is_err() {
                return Err(QueueError::EphemeralIsFull { max });
            }
        } else {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
        Ok(true)
    }

    /// Fill a previously claimed slot.
    pub fn commit(&self, message: Message, reserved_at: u64) {
        let id = message.id;
        let replaced = self.records.insert(
            id,
            EphemeralRecord {
                message,
                reserved_at,
            },
        );
        if replaced.is_some() {
            // Same id committed twice; the claim was double-counted.
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Release a claimed slot that will not be filled (nothing to take).
    pub fn cancel(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
    }

    /// Remove a record by id. Absent ids are a no-op, which is what makes
    /// double-finish and finish-after-rescue safe.
    pub fn remove(&self, id: &Uuid) -> Option<EphemeralRecord> {
        let removed = self.records.remove(id).map(|(_, rec)| rec);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Insert a record bypassing the bound — used when reloading persisted
    /// in-flight markers at open, which must never be dropped.
    pub fn load(&self, message: Message, reserved_at: u64) {
        let id = message.id;
        if self
            .records
            .insert(
                id,
                EphemeralRecord {
                    message,
                    reserved_at,
                },
            )
            .is_none()
        {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of messages reserved longer ago than `threshold_ms`.
    /// Records stay in place; the caller removes each one before it hands
    /// the message back to the queue.
    pub fn expired(&self, threshold_ms: u64, now: u64) -> Vec<Message> {
        self.records
            .iter()
            .filter(|entry| now.saturating_sub(entry.reserved_at) > threshold_ms)
            .map(|entry| entry.message.clone())
            .collect()
    }
}
