//! The storage engine collaborator: a versioned key/value store with column
//! families, used by the MVCC transaction engine.

pub mod engine;
mod memory;

pub use engine::{key_range, ColumnFamily, Engine, KeyRange, ScanIterator, Status};
pub use memory::Memory;
