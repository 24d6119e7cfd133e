//! JSON is used for all shardcast encodings: protocol messages, the catalog
//! and cluster-state files, and buffered messages in the forward queue. It is
//! self-describing and language-neutral, which matters because catalog and
//! cluster-state files are written by operators and other tools.
//!
//! Values on a stream are newline-terminated. The parser skips leading
//! whitespace, so any whitespace separation decodes fine, but writing one
//! value per line keeps the on-disk queue greppable.

use crate::error::Result;

/// Deserializes a value from a JSON byte slice.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Deserializes a single value from a reader.
pub fn deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(reader: R) -> Result<T> {
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    Ok(T::deserialize(&mut deserializer)?)
}

/// Deserializes a single value from a reader, or returns None if the reader
/// is closed. A connection reset is treated as a close, since peers drop
/// connections without ceremony.
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    match T::deserialize(&mut deserializer) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_eof() => Ok(None),
        Err(err) if err.io_error_kind() == Some(std::io::ErrorKind::ConnectionReset) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Serializes a value to a JSON byte vector.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Serializes a value into a writer, newline-terminated.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize>(
    mut writer: W,
    value: &T,
) -> Result<()> {
    serde_json::to_writer(&mut writer, value)?;
    writer.write_all(b"\n")?;
    Ok(())
}
