mod memory;
mod persistent;
mod ring;

pub use memory::MemoryQueue;
pub use persistent::PersistentQueue;
pub use ring::RingQueue;
