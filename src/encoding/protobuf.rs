//! Serde adapters for Raft protobuf types, for use with #[serde(with)]. The
//! message is embedded as a protobuf-encoded byte string, so it can travel
//! inside bincode-encoded structures.

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<M: prost::Message, S: Serializer>(msg: &M, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bytes(&msg.encode_to_vec())
}

pub fn deserialize<'de, M, D>(deserializer: D) -> Result<M, D::Error>
where
    M: prost::Message + Default,
    D: Deserializer<'de>,
{
    let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
    M::decode(bytes.as_slice()).map_err(serde::de::Error::custom)
}
