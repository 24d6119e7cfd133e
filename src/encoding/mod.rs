//! Wire and file encodings.
//!
//! Everything shardcast reads and writes is JSON: message envelopes on the
//! wire, the catalog file, the cluster-state file, and buffered messages on
//! disk. The json module wraps serde_json so the rest of the crate never
//! touches codec details directly.

pub mod json;

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Adds automatic JSON encode/decode methods to value types. These are used
/// for network protocol messages and for messages persisted in the forward
/// buffer.
pub trait Value: Serialize + DeserializeOwned {
    /// Decodes a value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        json::deserialize(bytes)
    }

    /// Decodes a value from a reader.
    fn decode_from<R: Read>(reader: R) -> Result<Self> {
        json::deserialize_from(reader)
    }

    /// Decodes a value from a reader, or returns None if the reader is
    /// closed.
    fn maybe_decode_from<R: Read>(reader: R) -> Result<Option<Self>> {
        json::maybe_deserialize_from(reader)
    }

    /// Encodes a value to a byte vector.
    fn encode(&self) -> Result<Vec<u8>> {
        json::serialize(self)
    }

    /// Encodes a value into a writer, newline-terminated so consecutive
    /// values self-delimit on a stream.
    fn encode_into<W: Write>(&self, writer: W) -> Result<()> {
        json::serialize_into(writer, self)
    }
}

/// Blanket implementations for types wrapping a value type.
impl<V: Value> Value for Option<V> {}
impl<V: Value> Value for Result<V> {}
impl<V: Value> Value for Vec<V> {}
impl<V1: Value, V2: Value> Value for (V1, V2) {}
