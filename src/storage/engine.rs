use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// Column families partition the versioned keyspace. The transaction engine
/// stores locks, commit records and values in separate families, so that e.g.
/// all locks in a key range can be found without touching any values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ColumnFamily {
    /// Versioned user values, keyed by transaction start version.
    Default,
    /// In-flight transaction locks, at most one per key.
    Lock,
    /// Commit and rollback records, keyed by commit version.
    Write,
}

impl ColumnFamily {
    /// All column families.
    pub const ALL: [ColumnFamily; 3] = [Self::Default, Self::Lock, Self::Write];
}

impl std::fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::Lock => "lock",
            Self::Write => "write",
        })
    }
}

/// A key range, as a pair of bounds. Used instead of RangeBounds since
/// engines are used as trait objects.
pub type KeyRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// A versioned key/value storage engine. Each column family holds arbitrary
/// byte keys with any number of u64 versions each; versions of a key are
/// independent entries and are never merged. Additionally, there is a single
/// unversioned keyspace for store metadata such as applied indexes. Writes are
/// only guaranteed durable after calling flush().
///
/// Only supports single-threaded use since all methods (including reads) take
/// a mutable reference. Callers share an engine via Arc<Mutex<_>>.
pub trait Engine: Send {
    /// Gets the value of a key at an exact version, if it exists.
    fn get(&mut self, cf: ColumnFamily, key: &[u8], version: u64) -> Result<Option<Vec<u8>>>;

    /// Sets the value of a key at a version, replacing any existing value.
    fn set(&mut self, cf: ColumnFamily, key: &[u8], version: u64, value: Vec<u8>) -> Result<()>;

    /// Deletes a key version, or does nothing if it does not exist.
    fn delete(&mut self, cf: ColumnFamily, key: &[u8], version: u64) -> Result<()>;

    /// Iterates over the versions of a key at or below max_version, newest
    /// first, as (version, value) pairs.
    fn versions(
        &mut self,
        cf: ColumnFamily,
        key: &[u8],
        max_version: u64,
    ) -> Box<dyn VersionIterator + '_>;

    /// Iterates over all entries in a key range in key order, and in
    /// descending version order for each key.
    fn scan(&mut self, cf: ColumnFamily, range: KeyRange) -> Box<dyn ScanIterator + '_>;

    /// Deletes all versions of all keys in a key range.
    fn delete_range(&mut self, cf: ColumnFamily, range: KeyRange) -> Result<()>;

    /// Gets the value of an unversioned key.
    fn get_unversioned(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Sets the value of an unversioned key.
    fn set_unversioned(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Deletes an unversioned key.
    fn delete_unversioned(&mut self, key: &[u8]) -> Result<()>;

    /// Iterates over unversioned keys in a key range, in key order.
    fn scan_unversioned(&mut self, range: KeyRange) -> Box<dyn UnversionedIterator + '_>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> Result<()>;

    /// Returns engine status.
    fn status(&mut self) -> Result<Status>;
}

/// A version iterator yielding (version, value), newest first.
pub trait VersionIterator: Iterator<Item = Result<(u64, Vec<u8>)>> {}

impl<I: Iterator<Item = Result<(u64, Vec<u8>)>>> VersionIterator for I {}

/// A scan iterator yielding (key, version, value).
pub trait ScanIterator: Iterator<Item = Result<(Vec<u8>, u64, Vec<u8>)>> {}

impl<I: Iterator<Item = Result<(Vec<u8>, u64, Vec<u8>)>>> ScanIterator for I {}

/// An unversioned scan iterator yielding (key, value).
pub trait UnversionedIterator: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

impl<I: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>>> UnversionedIterator for I {}

/// Engine status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,
    /// The number of live entries (key versions and unversioned keys).
    pub keys: u64,
    /// The logical size of live key/value pairs.
    pub size: u64,
}

/// Builds a key range from a half-open [start, end) pair where an empty end
/// means unbounded, as used by region key ranges.
pub fn key_range(start: &[u8], end: &[u8]) -> KeyRange {
    let end = match end.is_empty() {
        true => Bound::Unbounded,
        false => Bound::Excluded(end.to_vec()),
    };
    (Bound::Included(start.to_vec()), end)
}
