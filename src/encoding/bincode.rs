//! Wraps the bincode crate to always use the same options. Notably, the
//! default serialize/deserialize functions use fixed-length integer encoding
//! while DefaultOptions uses variable-length; everything here goes through
//! DefaultOptions so persisted blobs and wire messages agree.

use crate::error::Result;

use bincode::Options as _;

/// Returns the Bincode options used throughout, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Serializes a value using Bincode.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode().serialize(value)?)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}
