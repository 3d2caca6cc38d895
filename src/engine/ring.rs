use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use tracing::warn;

use crate::config::{ProducerMode, QueueOptions, RingConfig};
use crate::ephemeral::EphemeralStore;
use crate::error::{QueueError, Result};
use crate::message::{now_millis, IdGenerator, Message};
use crate::queue::Queue;
use crate::sweeper::{SweepTarget, Sweeper};

/// One ring slot. The sequence counter carries the publish/consume handshake:
/// a producer may write when `sequence == position`, a consumer may read when
/// `sequence == position + 1`. The release store on `sequence` is the only
/// boundary that makes the payload write visible, so no message is ever read
/// before its publish completes.
struct Slot {
    sequence: AtomicU64,
    value: UnsafeCell<Option<Message>>,
}

/// Fixed-capacity circular buffer with monotonic publish/consume cursors.
///
/// The multi-producer claim is a compare-and-swap loop on the publish cursor;
/// single-producer mode claims with a plain increment. Consumers always use
/// the CAS claim (the sweeper and user threads may pop concurrently).
/// Capacity is rounded up to a power of two so slot indexing is a bit-mask.
pub(crate) struct RingBuffer {
    slots: Box<[Slot]>,
    mask: u64,
    publish: CachePadded<AtomicU64>,
    consume: CachePadded<AtomicU64>,
    mode: ProducerMode,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(capacity: usize, mode: ProducerMode) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots: Box<[Slot]> = (0..capacity as u64)
            .map(|seq| Slot {
                sequence: AtomicU64::new(seq),
                value: UnsafeCell::new(None),
            })
            .collect();
        Self {
            slots,
            mask: capacity as u64 - 1,
            publish: CachePadded::new(AtomicU64::new(0)),
            consume: CachePadded::new(AtomicU64::new(0)),
            mode,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the next slot past the publish cursor and store the message.
    /// Returns the message back when the ring is full.
    pub fn try_push(&self, message: Message) -> std::result::Result<(), Message> {
        match self.mode {
            ProducerMode::Single => self.push_single(message),
            ProducerMode::Multi => self.push_multi(message),
        }
    }

    fn push_single(&self, message: Message) -> std::result::Result<(), Message> {
        let pos = self.publish.load(Ordering::Relaxed);
        let slot = &self.slots[(pos & self.mask) as usize];
        if slot.sequence.load(Ordering::Acquire) != pos {
            // Slot not yet consumed: ring full.
            return Err(message);
        }
        unsafe { *slot.value.get() = Some(message) };
        slot.sequence.store(pos + 1, Ordering::Release);
        self.publish.store(pos + 1, Ordering::Relaxed);
        Ok(())
    }

    fn push_multi(&self, message: Message) -> std::result::Result<(), Message> {
        let mut pos = self.publish.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as i64 - pos as i64;
            if dif == 0 {
                match self.publish.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { *slot.value.get() = Some(message) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return Err(message);
            } else {
                pos = self.publish.load(Ordering::Relaxed);
            }
        }
    }

    /// Advance the consume cursor and return the slot's message, or `None`
    /// when the cursors meet.
    pub fn try_pop(&self) -> Option<Message> {
        let mut pos = self.consume.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = seq as i64 - (pos + 1) as i64;
            if dif == 0 {
                match self.consume.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let message = unsafe { (*slot.value.get()).take() };
                        // Free the slot for the producer one lap ahead.
                        slot.sequence.store(pos + self.mask + 1, Ordering::Release);
                        return message;
                    }
                    Err(current) => pos = current,
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.consume.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate occupancy; exact only when producers and consumers are
    /// quiescent.
    pub fn len(&self) -> usize {
        let publish = self.publish.load(Ordering::Acquire);
        let consume = self.consume.load(Ordering::Acquire);
        publish.saturating_sub(consume) as usize
    }
}

/// Lock-minimized in-memory engine over the ring buffer.
pub struct RingQueue {
    inner: Arc<RingInner>,
    ids: Arc<IdGenerator>,
    sweeper: Option<Sweeper>,
}

struct RingInner {
    ring: RingBuffer,
    strict: bool,
    ephemeral: EphemeralStore,
}

impl RingQueue {
    pub fn new(config: RingConfig, options: QueueOptions, ids: Arc<IdGenerator>) -> Result<Self> {
        let inner = Arc::new(RingInner {
            ring: RingBuffer::new(config.ring_size, config.producer_mode),
            strict: options.strict_capacity,
            ephemeral: EphemeralStore::new(
                options.ephemeral_disabled,
                options.ephemeral_bound(),
            ),
        });

        let sweeper = if options.ephemeral_disabled {
            None
        } else {
            Some(
                Sweeper::spawn(
                    inner.clone() as Arc<dyn SweepTarget>,
                    Duration::from_millis(options.sweep_interval_ms),
                    options.orphan_threshold_ms,
                )
                .map_err(|e| QueueError::SweeperSpawn(e.to_string()))?,
            )
        };

        Ok(Self {
            inner,
            ids,
            sweeper,
        })
    }

    /// Build a message stamped with this engine's id generator.
    pub fn new_message(&self, content: Vec<u8>) -> Message {
        Message::new(content, &self.ids)
    }

    /// Slot count after power-of-two rounding.
    pub fn capacity(&self) -> usize {
        self.inner.ring.capacity()
    }

    /// Stop the sweeper and release the engine.
    pub fn close(mut self) {
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
    }

    fn reinsert(&self, message: Message) -> Result<bool> {
        let id = message.id;
        // Resolve the old reservation before the message becomes visible
        // again: a concurrent take() may reserve it afresh, and that record
        // must survive this call.
        let prior = self.inner.ephemeral.remove(&id);
        match self.inner.ring.try_push(message) {
            Ok(()) => Ok(true),
            Err(_) => {
                if let Some(record) = prior {
                    self.inner.ephemeral.load(record.message, record.reserved_at);
                }
                Ok(false)
            }
        }
    }
}

impl Queue for RingQueue {
    fn queue(&self, message: Message) -> Result<bool> {
        match self.inner.ring.try_push(message) {
            Ok(()) => Ok(true),
            Err(_) if self.inner.strict => Err(QueueError::QueueIsFull {
                max: self.inner.ring.capacity(),
            }),
            Err(_) => Ok(false),
        }
    }

    fn take(&self) -> Result<Option<Message>> {
        let reserved = self.inner.ephemeral.try_reserve()?;
        match self.inner.ring.try_pop() {
            Some(message) => {
                if reserved {
                    self.inner.ephemeral.commit(message.clone(), now_millis());
                }
                Ok(Some(message))
            }
            None => {
                if reserved {
                    self.inner.ephemeral.cancel();
                }
                Ok(None)
            }
        }
    }

    fn finish(&self, message: &Message) -> Result<()> {
        self.inner.ephemeral.remove(&message.id);
        Ok(())
    }

    fn requeue(&self, mut message: Message) -> Result<bool> {
        message.mark_requeued();
        self.reinsert(message)
    }

    fn requeue_silent(&self, message: Message) -> Result<bool> {
        self.reinsert(message)
    }

    fn queue_size(&self) -> Result<usize> {
        Ok(self.inner.ring.len())
    }

    fn ephemeral_size(&self) -> usize {
        self.inner.ephemeral.len()
    }
}

impl SweepTarget for RingInner {
    fn rescue_orphans(&self, threshold_ms: u64) -> usize {
        let now = now_millis();
        let mut rescued = 0;
        for message in self.ephemeral.expired(threshold_ms, now) {
            let id = message.id;
            // Resolved by its consumer since the scan; nothing to rescue.
            let Some(record) = self.ephemeral.remove(&id) else {
                continue;
            };
            match self.ring.try_push(record.message) {
                Ok(()) => rescued += 1,
                Err(returned) => {
                    self.ephemeral.load(returned, record.reserved_at);
                    warn!(%id, "ring full during orphan rescue, will retry next sweep");
                }
            }
        }
        rescued
    }
}
