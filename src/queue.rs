use crate::error::Result;
use crate::message::Message;

/// The uniform queue contract every backend implements.
///
/// A message is in exactly one of three logical states: queued (visible in
/// the backing store), reserved (checked out into the ephemeral store via
/// `take`), or gone (finished). Transitions are explicit — `take` moves
/// queued → reserved, `finish` moves reserved → gone, the requeue pair moves
/// reserved → queued. Nothing blocks: `take` is a poll-style primitive and
/// callers wanting blocking consumption poll with backoff.
pub trait Queue: Send + Sync {
    /// Insert at the tail. Returns `Ok(false)` on ordinary backpressure
    /// (bounded store at capacity); raises `QueueIsFull` instead when the
    /// engine is configured with `strict_capacity`.
    fn queue(&self, message: Message) -> Result<bool>;

    /// Pop the head and reserve it in the ephemeral store. `Ok(None)` when
    /// nothing is queued. The pop and the reservation are one failure
    /// domain: a message is never removed from queued state without the
    /// paired reservation succeeding in the same call.
    fn take(&self) -> Result<Option<Message>>;

    /// Resolve a reservation as processed. Idempotent by id: finishing a
    /// message that was already finished or rescued is a no-op.
    fn finish(&self, message: &Message) -> Result<()>;

    /// Return a reserved message to the tail as a normal retry: increments
    /// `num_requeues` and refreshes `timestamp`. `Ok(false)` if the backing
    /// store refused the re-insert (the reservation is kept).
    fn requeue(&self, message: Message) -> Result<bool>;

    /// Return a reserved message to the tail without retry bookkeeping —
    /// `num_requeues` and `timestamp` are left untouched. Used by the
    /// sweeper and for bookkeeping-neutral retries.
    fn requeue_silent(&self, message: Message) -> Result<bool>;

    /// Point-in-time count of queued messages; best-effort under
    /// concurrency.
    fn queue_size(&self) -> Result<usize>;

    /// Point-in-time count of reserved messages.
    fn ephemeral_size(&self) -> usize;
}
