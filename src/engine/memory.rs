use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::config::{MemoryConfig, QueueOptions};
use crate::ephemeral::EphemeralStore;
use crate::error::{QueueError, Result};
use crate::message::{now_millis, IdGenerator, Message};
use crate::queue::Queue;
use crate::sweeper::{SweepTarget, Sweeper};

/// Bounded/unbounded in-process FIFO behind a single mutex.
///
/// The lowest-complexity engine; exists primarily as a reference and test
/// backend for the queue contract.
pub struct MemoryQueue {
    inner: Arc<MemoryInner>,
    ids: Arc<IdGenerator>,
    sweeper: Option<Sweeper>,
}

struct MemoryInner {
    deque: Mutex<VecDeque<Message>>,
    bound: Option<usize>,
    strict: bool,
    ephemeral: EphemeralStore,
}

impl MemoryQueue {
    pub fn new(
        config: MemoryConfig,
        options: QueueOptions,
        ids: Arc<IdGenerator>,
    ) -> Result<Self> {
        let inner = Arc::new(MemoryInner {
            deque: Mutex::new(VecDeque::new()),
            bound: config.bound(),
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

    /// Stop the sweeper and release the engine.
    pub fn close(mut self) {
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
    }

    fn reinsert(&self, message: Message) -> Result<bool> {
        let id = message.id;
        // Resolve the old reservation before the message becomes visible
        // again: once it is back in the queue, a concurrent take() may
        // reserve it afresh, and that record must survive this call.
        let prior = self.inner.ephemeral.remove(&id);
        match self.inner.push_tail(message) {
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

impl MemoryInner {
    fn push_tail(&self, message: Message) -> std::result::Result<(), Message> {
        let mut deque = self.deque.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bound) = self.bound {
            if deque.len() >= bound {
                return Err(message);
            }
        }
        deque.push_back(message);
        Ok(())
    }
}

impl Queue for MemoryQueue {
    fn queue(&self, message: Message) -> Result<bool> {
        match self.inner.push_tail(message) {
            Ok(()) => Ok(true),
            Err(_) if self.inner.strict => Err(QueueError::QueueIsFull {
                max: self.inner.bound.unwrap_or(0),
            }),
            Err(_) => Ok(false),
        }
    }

    fn take(&self) -> Result<Option<Message>> {
        let reserved = self.inner.ephemeral.try_reserve()?;
        let popped = {
            let mut deque = self.inner.deque.lock().unwrap_or_else(|e| e.into_inner());
            deque.pop_front()
        };
        match popped {
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
        let deque = self.inner.deque.lock().unwrap_or_else(|e| e.into_inner());
        Ok(deque.len())
    }

    fn ephemeral_size(&self) -> usize {
        self.inner.ephemeral.len()
    }
}

impl SweepTarget for MemoryInner {
    fn rescue_orphans(&self, threshold_ms: u64) -> usize {
        let now = now_millis();
        let mut rescued = 0;
        for message in self.ephemeral.expired(threshold_ms, now) {
            let id = message.id;
            // Resolved by its consumer since the scan; nothing to rescue.
            let Some(record) = self.ephemeral.remove(&id) else {
                continue;
            };
            match self.push_tail(record.message) {
                Ok(()) => rescued += 1,
                Err(returned) => {
                    self.ephemeral.load(returned, record.reserved_at);
                    warn!(%id, "queue full during orphan rescue, will retry next sweep");
                }
            }
        }
        rescued
    }
}
