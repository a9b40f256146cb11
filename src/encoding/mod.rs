//! Binary data encodings.
//!
//! * keycode: used for keys in the storage engine, preserving key order.
//! * bincode: used for values, commands, log records and network protocols.
//!
//! Raft protocol messages (entries, hard state, snapshots) use the protobuf
//! encoding of the Raft library itself, via prost.

pub mod bincode;
pub mod keycode;
pub mod protobuf;

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Adds automatic Keycode encode/decode methods to key enums. These are used
/// as keys in the storage engine.
pub trait Key<'de>: Serialize + Deserialize<'de> {
    /// Decodes a key from a byte slice using Keycode.
    fn decode(bytes: &'de [u8]) -> Result<Self> {
        keycode::deserialize(bytes)
    }

    /// Encodes a key to a byte vector using Keycode.
    fn encode(&self) -> Result<Vec<u8>> {
        keycode::serialize(self)
    }
}

/// Adds automatic Bincode encode/decode methods to value types. These are used
/// not only for values in the storage engine, but also for e.g. Raft commands,
/// WAL records and network protocol messages.
pub trait Value: Serialize + DeserializeOwned {
    /// Decodes a value from a byte slice using Bincode.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Decodes a value from a reader using Bincode, or returns None if the
    /// reader is closed.
    fn maybe_decode_from<R: Read>(reader: R) -> Result<Option<Self>> {
        bincode::maybe_deserialize_from(reader)
    }

    /// Encodes a value to a byte vector using Bincode.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Encodes a value into a writer using Bincode.
    fn encode_into<W: Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)
    }
}

/// Blanket implementations for various types wrapping a value type.
impl<V: Value> Value for Option<V> {}
impl<V: Value> Value for Result<V> {}
impl<V: Value> Value for Vec<V> {}
impl<V1: Value, V2: Value> Value for (V1, V2) {}
