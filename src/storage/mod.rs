pub mod keys;
mod rocksdb;

pub use self::rocksdb::{InFlightMarker, QueueStore, WriteBatchOp};
pub use keys::KeyGenerator;
