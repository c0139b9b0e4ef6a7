//! Binary encoding of log entries, snapshots, messages, and commands, all
//! via Bincode.

pub mod bincode;

use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A value that can be encoded to and decoded from binary form. Blanket
/// methods over the Bincode wrappers, so call sites read value.encode()
/// rather than spelling out the codec.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decodes a value from bytes.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}
