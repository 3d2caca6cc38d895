use std::path::Path;

use rocksdb::{
    ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    WriteBatch,
};
use serde::{Deserialize, Serialize};

use crate::config::StoreOptions;
use crate::error::{StorageError, StorageResult};
use crate::message::Message;

type DB = DBWithThreadMode<MultiThreaded>;

/// Durable ephemeral marker mirrored alongside the in-memory reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightMarker {
    pub message: Message,
    pub reserved_at: u64,
}

/// A single operation in an atomic write batch.
#[derive(Debug)]
pub enum WriteBatchOp {
    PutMessage {
        queue: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    DeleteMessage {
        queue: String,
        key: Vec<u8>,
    },
    PutEphemeral {
        queue: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    DeleteEphemeral {
        queue: String,
        key: Vec<u8>,
    },
}

/// Embedded ordered key-value store shared by persistent queue engines.
///
/// Each named queue gets two column families on the one database handle:
/// `q:<name>` holds queue-visible entries under monotonic insertion keys,
/// `eph:<name>` holds durable in-flight markers keyed by message id. The
/// handle is safe to share across threads after open; RocksDB does its own
/// internal locking for concurrent readers and writers.
pub struct QueueStore {
    db: DB,
    read_only: bool,
}

/// Column family holding queue-visible entries for `queue`.
pub(crate) fn messages_cf(queue: &str) -> String {
    format!("q:{queue}")
}

/// Column family holding durable in-flight markers for `queue`.
pub(crate) fn ephemeral_cf(queue: &str) -> String {
    format!("eph:{queue}")
}

impl QueueStore {
    /// Open or create the store in read-write mode, reattaching every column
    /// family already present on disk.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let existing = DB::list_cf(&Options::default(), &path).unwrap_or_default();
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = existing
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self {
            db,
            read_only: false,
        })
    }

    /// Open the store read-only, without taking the write lock. Inspection
    /// tools use this against a live database.
    pub fn open_read_only(path: impl AsRef<Path>) -> StorageResult<Self> {
        let existing = DB::list_cf(&Options::default(), &path)?;
        let db = DB::open_cf_for_read_only(&Options::default(), path, existing, false)?;
        Ok(Self {
            db,
            read_only: true,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    // --- Column family management ---

    pub fn has_cf(&self, name: &str) -> bool {
        self.db.cf_handle(name).is_some()
    }

    pub fn create_cf(&self, name: &str, opts: &StoreOptions) -> StorageResult<()> {
        let mut cf_opts = Options::default();
        if let Some(size) = opts.write_buffer_size {
            cf_opts.set_write_buffer_size(size);
        }
        if let Some(n) = opts.max_write_buffer_number {
            cf_opts.set_max_write_buffer_number(n);
        }
        if let Some(size) = opts.target_file_size_base {
            cf_opts.set_target_file_size_base(size);
        }
        self.db.create_cf(name, &cf_opts)?;
        Ok(())
    }

    pub fn drop_cf(&self, name: &str) -> StorageResult<()> {
        self.db.drop_cf(name)?;
        Ok(())
    }

    /// Create the two column families backing `queue` if they do not exist.
    pub fn ensure_queue(&self, queue: &str, opts: &StoreOptions) -> StorageResult<()> {
        for name in [messages_cf(queue), ephemeral_cf(queue)] {
            if !self.has_cf(&name) {
                self.create_cf(&name, opts)?;
            }
        }
        Ok(())
    }

    /// Drop both column families backing `queue`.
    pub fn drop_queue(&self, queue: &str) -> StorageResult<()> {
        for name in [messages_cf(queue), ephemeral_cf(queue)] {
            if self.has_cf(&name) {
                self.drop_cf(&name)?;
            }
        }
        Ok(())
    }

    /// Trigger background compaction over both column families.
    pub fn compact(&self, queue: &str) -> StorageResult<()> {
        for name in [messages_cf(queue), ephemeral_cf(queue)] {
            let cf = self.cf(&name)?;
            self.db
                .compact_range_cf(&cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    /// Approximate queue-visible entry count, from RocksDB's key estimate.
    /// Cheap, but not exact — use `count_messages` when exactness matters.
    pub fn estimate_len(&self, queue: &str) -> StorageResult<u64> {
        let cf = self.cf(&messages_cf(queue))?;
        Ok(self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }

    // --- Message operations ---

    pub fn put_message(&self, queue: &str, key: &[u8], message: &Message) -> StorageResult<()> {
        let cf = self.cf(&messages_cf(queue))?;
        let value = serde_json::to_vec(message)?;
        self.db.put_cf(&cf, key, value)?;
        Ok(())
    }

    /// The queue-visible entry with the smallest insertion key, FIFO head.
    pub fn first_message(&self, queue: &str) -> StorageResult<Option<(Vec<u8>, Message)>> {
        let cf = self.cf(&messages_cf(queue))?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                let message: Message = serde_json::from_slice(&value)?;
                Ok(Some((key.to_vec(), message)))
            }
            None => Ok(None),
        }
    }

    pub fn delete_message(&self, queue: &str, key: &[u8]) -> StorageResult<()> {
        let cf = self.cf(&messages_cf(queue))?;
        self.db.delete_cf(&cf, key)?;
        Ok(())
    }

    /// Exact queue-visible entry count by full iteration; used to rebuild
    /// counters at open.
    pub fn count_messages(&self, queue: &str) -> StorageResult<usize> {
        let cf = self.cf(&messages_cf(queue))?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Queue-visible entries in FIFO order starting from `after` (exclusive),
    /// or from the head when `after` is `None`.
    pub fn scan_messages(
        &self,
        queue: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<(Vec<u8>, Message)>> {
        let cf = self.cf(&messages_cf(queue))?;
        let mode = match after {
            Some(key) => IteratorMode::From(key, Direction::Forward),
            None => IteratorMode::Start,
        };
        let mut results = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item?;
            if after == Some(key.as_ref()) {
                continue;
            }
            let message: Message = serde_json::from_slice(&value)?;
            results.push((key.to_vec(), message));
            if results.len() == limit {
                break;
            }
        }
        Ok(results)
    }

    // --- Ephemeral marker operations ---

    /// All durable in-flight markers for `queue`; scanned at open to reload
    /// the in-memory ephemeral store after a crash.
    pub fn scan_ephemeral(&self, queue: &str) -> StorageResult<Vec<InFlightMarker>> {
        let cf = self.cf(&ephemeral_cf(queue))?;
        let mut results = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            let marker: InFlightMarker = serde_json::from_slice(&value)?;
            results.push(marker);
        }
        Ok(results)
    }

    // --- Batch operations ---

    /// Atomically apply a batch of writes across column families.
    pub fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        let mut batch = WriteBatch::default();

        for op in ops {
            match op {
                WriteBatchOp::PutMessage { queue, key, value } => {
                    let cf = self.cf(&messages_cf(&queue))?;
                    batch.put_cf(&cf, &key, &value);
                }
                WriteBatchOp::DeleteMessage { queue, key } => {
                    let cf = self.cf(&messages_cf(&queue))?;
                    batch.delete_cf(&cf, &key);
                }
                WriteBatchOp::PutEphemeral { queue, key, value } => {
                    let cf = self.cf(&ephemeral_cf(&queue))?;
                    batch.put_cf(&cf, &key, &value);
                }
                WriteBatchOp::DeleteEphemeral { queue, key } => {
                    let cf = self.cf(&ephemeral_cf(&queue))?;
                    batch.delete_cf(&cf, &key);
                }
            }
        }

        self.db.write(batch)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> StorageResult<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::RocksDb(format!("column family not found: {name}")))
    }
}
