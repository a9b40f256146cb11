use super::engine::{
    ColumnFamily, Engine, KeyRange, ScanIterator, Status, UnversionedIterator, VersionIterator,
};
use crate::encoding::{self, Key as _};
use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Engine keys, using the KeyCode encoding which preserves the ordering and
/// grouping of keys. Versions are stored inverted (u64::MAX - version), such
/// that the versions of a key are ordered newest first. Cow byte slices allow
/// encoding borrowed values and decoding into owned values.
#[derive(Debug, Deserialize, Serialize)]
enum Key<'a> {
    /// An unversioned metadata key.
    Unversioned(
        #[serde(with = "serde_bytes")]
        #[serde(borrow)]
        Cow<'a, [u8]>,
    ),
    /// A versioned key in a column family, with an inverted version.
    Versioned(
        ColumnFamily,
        #[serde(with = "serde_bytes")]
        #[serde(borrow)]
        Cow<'a, [u8]>,
        u64,
    ),
}

impl<'a> encoding::Key<'a> for Key<'a> {}

/// Key prefixes, allowing prefix scans of specific parts of the keyspace.
/// These must match the keys -- in particular the enum variant indexes.
#[derive(Debug, Deserialize, Serialize)]
enum KeyPrefix {
    Unversioned,
    Versioned(ColumnFamily),
}

impl encoding::Key<'_> for KeyPrefix {}

/// Returns the exclusive end bound of a prefix scan.
fn prefix_end(prefix: &[u8]) -> Bound<Vec<u8>> {
    match prefix.iter().rposition(|b| *b != 0xff) {
        Some(i) => Bound::Excluded(
            prefix.iter().take(i).copied().chain(std::iter::once(prefix[i] + 1)).collect(),
        ),
        None => Bound::Unbounded,
    }
}

/// An in-memory storage engine using the Rust standard library B-tree
/// implementation. Data is not persisted.
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new Memory storage engine.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }

    /// Maps a user key range in a column family to an engine key range.
    fn versioned_range(cf: ColumnFamily, range: &KeyRange) -> Result<KeyRange> {
        let start = match &range.0 {
            Bound::Included(k) => Bound::Included(Key::Versioned(cf, k.into(), 0).encode()?),
            Bound::Excluded(k) => Bound::Excluded(Key::Versioned(cf, k.into(), u64::MAX).encode()?),
            Bound::Unbounded => Bound::Included(KeyPrefix::Versioned(cf).encode()?),
        };
        let end = match &range.1 {
            Bound::Included(k) => Bound::Included(Key::Versioned(cf, k.into(), u64::MAX).encode()?),
            Bound::Excluded(k) => Bound::Excluded(Key::Versioned(cf, k.into(), 0).encode()?),
            Bound::Unbounded => prefix_end(&KeyPrefix::Versioned(cf).encode()?),
        };
        Ok((start, end))
    }

    /// Maps an unversioned key range to an engine key range.
    fn unversioned_range(range: &KeyRange) -> Result<KeyRange> {
        let map = |bound: &Bound<Vec<u8>>| -> Result<Bound<Vec<u8>>> {
            Ok(match bound {
                Bound::Included(k) => Bound::Included(Key::Unversioned(k.into()).encode()?),
                Bound::Excluded(k) => Bound::Excluded(Key::Unversioned(k.into()).encode()?),
                Bound::Unbounded => Bound::Unbounded,
            })
        };
        let start = match &range.0 {
            Bound::Unbounded => Bound::Included(KeyPrefix::Unversioned.encode()?),
            bound => map(bound)?,
        };
        let end = match &range.1 {
            Bound::Unbounded => prefix_end(&KeyPrefix::Unversioned.encode()?),
            bound => map(bound)?,
        };
        Ok((start, end))
    }

    /// Returns a B-tree range for the given bounds, or an empty range if the
    /// bounds are inverted (BTreeMap::range panics on those).
    fn range(
        &self,
        range: KeyRange,
    ) -> std::collections::btree_map::Range<'_, Vec<u8>, Vec<u8>> {
        let empty = match (&range.0, &range.1) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s) | Bound::Excluded(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e)) => s >= e,
            _ => false,
        };
        match empty {
            true => self.data.range(Vec::new()..Vec::new()),
            false => self.data.range(range),
        }
    }
}

impl Engine for Memory {
    fn get(&mut self, cf: ColumnFamily, key: &[u8], version: u64) -> Result<Option<Vec<u8>>> {
        let key = Key::Versioned(cf, key.into(), u64::MAX - version).encode()?;
        Ok(self.data.get(&key).cloned())
    }

    fn set(&mut self, cf: ColumnFamily, key: &[u8], version: u64, value: Vec<u8>) -> Result<()> {
        let key = Key::Versioned(cf, key.into(), u64::MAX - version).encode()?;
        self.data.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, cf: ColumnFamily, key: &[u8], version: u64) -> Result<()> {
        let key = Key::Versioned(cf, key.into(), u64::MAX - version).encode()?;
        self.data.remove(&key);
        Ok(())
    }

    fn versions(
        &mut self,
        cf: ColumnFamily,
        key: &[u8],
        max_version: u64,
    ) -> Box<dyn VersionIterator + '_> {
        let bounds = || -> Result<KeyRange> {
            Ok((
                Bound::Included(Key::Versioned(cf, key.into(), u64::MAX - max_version).encode()?),
                Bound::Included(Key::Versioned(cf, key.into(), u64::MAX).encode()?),
            ))
        };
        match bounds() {
            Ok(range) => Box::new(self.range(range).map(|(k, v)| -> Result<(u64, Vec<u8>)> {
                match Key::decode(k)? {
                    Key::Versioned(_, _, inverted) => Ok((u64::MAX - inverted, v.clone())),
                    key => crate::errdata!("unexpected key {key:?}"),
                }
            })),
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }

    fn scan(&mut self, cf: ColumnFamily, range: KeyRange) -> Box<dyn ScanIterator + '_> {
        match Self::versioned_range(cf, &range) {
            Ok(range) => Box::new(self.range(range).map(
                |(k, v)| -> Result<(Vec<u8>, u64, Vec<u8>)> {
                    match Key::decode(k)? {
                        Key::Versioned(_, key, inverted) => {
                            Ok((key.into_owned(), u64::MAX - inverted, v.clone()))
                        }
                        key => crate::errdata!("unexpected key {key:?}"),
                    }
                },
            )),
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }

    fn delete_range(&mut self, cf: ColumnFamily, range: KeyRange) -> Result<()> {
        let range = Self::versioned_range(cf, &range)?;
        let keys: Vec<Vec<u8>> = self.range(range).map(|(k, _)| k.clone()).collect();
        for key in keys {
            self.data.remove(&key);
        }
        Ok(())
    }

    fn get_unversioned(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(&Key::Unversioned(key.into()).encode()?).cloned())
    }

    fn set_unversioned(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(Key::Unversioned(key.into()).encode()?, value);
        Ok(())
    }

    fn delete_unversioned(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(&Key::Unversioned(key.into()).encode()?);
        Ok(())
    }

    fn scan_unversioned(&mut self, range: KeyRange) -> Box<dyn UnversionedIterator + '_> {
        match Self::unversioned_range(&range) {
            Ok(range) => Box::new(self.range(range).map(|(k, v)| -> Result<(Vec<u8>, Vec<u8>)> {
                match Key::decode(k)? {
                    Key::Unversioned(key) => Ok((key.into_owned(), v.clone())),
                    key => crate::errdata!("unexpected key {key:?}"),
                }
            })),
            Err(err) => Box::new(std::iter::once(Err(err))),
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().fold(0, |size, (k, v)| size + k.len() as u64 + v.len() as u64),
        })
    }
}
