//! The queue contract, exercised identically against every engine.

use std::sync::Arc;
use std::time::Duration;

use coda::telemetry::init_tracing;
use coda::{
    IdGenerator, MemoryConfig, MemoryQueue, Message, PersistentQueue, Queue, QueueOptions,
    QueueStore, RingConfig, RingQueue, StoreOptions,
};

fn ids() -> Arc<IdGenerator> {
    Arc::new(IdGenerator::default())
}

fn memory_engine(options: QueueOptions) -> MemoryQueue {
    init_tracing();
    MemoryQueue::new(MemoryConfig::default(), options, ids()).unwrap()
}

fn ring_engine(options: QueueOptions) -> RingQueue {
    init_tracing();
    RingQueue::new(RingConfig::default(), options, ids()).unwrap()
}

fn persistent_engine(dir: &tempfile::TempDir, options: QueueOptions) -> PersistentQueue {
    init_tracing();
    let store = Arc::new(QueueStore::open(dir.path()).unwrap());
    PersistentQueue::open(store, "contract", options, &StoreOptions::default(), ids()).unwrap()
}

/// The end-to-end delivery walk: enqueue, take, retry, take, finish.
fn hello_scenario(q: &dyn Queue, ids: &IdGenerator) {
    let msg = Message::new(b"hello".to_vec(), ids);
    assert!(q.queue(msg).unwrap());

    let first = q.take().unwrap().expect("message should be queued");
    assert_eq!(first.content, b"hello");
    assert_eq!(first.num_requeues, 0);

    assert!(q.requeue(first).unwrap());

    let second = q.take().unwrap().expect("requeued message should return");
    assert_eq!(second.num_requeues, 1);
    assert_eq!(second.content, b"hello");

    q.finish(&second).unwrap();
    assert_eq!(q.ephemeral_size(), 0);
    assert!(q.take().unwrap().is_none(), "finished message must be gone");
}

/// Accounting across take/finish for backends that track both sides.
fn accounting_scenario(q: &dyn Queue, ids: &IdGenerator) {
    q.queue(Message::new(b"one".to_vec(), ids)).unwrap();
    q.queue(Message::new(b"two".to_vec(), ids)).unwrap();
    assert_eq!(q.queue_size().unwrap(), 2);
    assert_eq!(q.ephemeral_size(), 0);

    let msg = q.take().unwrap().unwrap();
    assert_eq!(q.queue_size().unwrap(), 1);
    assert_eq!(q.ephemeral_size(), 1);

    q.finish(&msg).unwrap();
    assert_eq!(q.ephemeral_size(), 0);

    // double-finish has no observable effect
    q.finish(&msg).unwrap();
    assert_eq!(q.ephemeral_size(), 0);
    assert_eq!(q.queue_size().unwrap(), 1);
}

/// An abandoned reservation comes back through the sweeper with its retry
/// counter untouched.
fn at_least_once_scenario(q: &dyn Queue, ids: &IdGenerator) {
    q.queue(Message::new(b"abandoned".to_vec(), ids)).unwrap();
    let taken = q.take().unwrap().unwrap();
    assert!(q.take().unwrap().is_none());

    std::thread::sleep(Duration::from_millis(150));

    let rescued = q.take().unwrap().expect("sweeper should rescue the orphan");
    assert_eq!(rescued.id, taken.id);
    assert_eq!(rescued.content, b"abandoned");
    assert_eq!(rescued.num_requeues, 0, "rescue must not count as a retry");

    // the presumed-dead consumer coming back is harmless
    q.finish(&taken).unwrap();
    q.finish(&rescued).unwrap();
    assert_eq!(q.ephemeral_size(), 0);
}

fn sweep_fast() -> QueueOptions {
    QueueOptions {
        sweep_interval_ms: 10,
        orphan_threshold_ms: 20,
        ..Default::default()
    }
}

#[test]
fn memory_hello_scenario() {
    let q = memory_engine(QueueOptions::default());
    hello_scenario(&q, &IdGenerator::default());
}

#[test]
fn ring_hello_scenario() {
    let q = ring_engine(QueueOptions::default());
    hello_scenario(&q, &IdGenerator::default());
}

#[test]
fn persistent_hello_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let q = persistent_engine(&dir, QueueOptions::default());
    hello_scenario(&q, &IdGenerator::default());
}

#[test]
fn memory_accounting() {
    let q = memory_engine(QueueOptions::default());
    accounting_scenario(&q, &IdGenerator::default());
}

#[test]
fn ring_accounting() {
    let q = ring_engine(QueueOptions::default());
    accounting_scenario(&q, &IdGenerator::default());
}

#[test]
fn persistent_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let q = persistent_engine(&dir, QueueOptions::default());
    accounting_scenario(&q, &IdGenerator::default());
}

#[test]
fn memory_at_least_once() {
    let q = memory_engine(sweep_fast());
    at_least_once_scenario(&q, &IdGenerator::default());
}

#[test]
fn ring_at_least_once() {
    let q = ring_engine(sweep_fast());
    at_least_once_scenario(&q, &IdGenerator::default());
}

#[test]
fn persistent_at_least_once() {
    let dir = tempfile::tempdir().unwrap();
    let q = persistent_engine(&dir, sweep_fast());
    at_least_once_scenario(&q, &IdGenerator::default());
}

#[test]
fn capacity_enforcement_on_list_engine() {
    let q = MemoryQueue::new(
        MemoryConfig { boundary: 3 },
        QueueOptions::default(),
        ids(),
    )
    .unwrap();
    let gen = IdGenerator::default();

    for _ in 0..3 {
        assert!(q.queue(Message::new(vec![0], &gen)).unwrap());
    }
    assert!(!q.queue(Message::new(vec![0], &gen)).unwrap());
    assert_eq!(q.queue_size().unwrap(), 3);
}

#[test]
fn ring_overflow_and_recovery() {
    let q = RingQueue::new(
        RingConfig {
            ring_size: 4,
            ..Default::default()
        },
        QueueOptions {
            strict_capacity: true,
            ..Default::default()
        },
        ids(),
    )
    .unwrap();
    let gen = IdGenerator::default();

    for _ in 0..4 {
        assert!(q.queue(Message::new(b"fill".to_vec(), &gen)).unwrap());
    }
    assert!(matches!(
        q.queue(Message::new(b"overflow".to_vec(), &gen)),
        Err(coda::QueueError::QueueIsFull { max: 4 })
    ));

    q.take().unwrap().unwrap();
    assert!(q.queue(Message::new(b"fits-now".to_vec(), &gen)).unwrap());
}

#[test]
fn wire_round_trip_through_persistent_store() {
    // A message that crosses the storage boundary and back is identical.
    let dir = tempfile::tempdir().unwrap();
    let q = persistent_engine(&dir, QueueOptions::default());
    let gen = IdGenerator::default();

    let original = Message::new(vec![0x00, 0x01, 0xFE, 0xFF], &gen);
    q.queue(original.clone()).unwrap();

    let loaded = q.take().unwrap().unwrap();
    assert_eq!(loaded, original);
    assert_eq!(loaded.content, vec![0x00, 0x01, 0xFE, 0xFF]);
}
