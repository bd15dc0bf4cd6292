use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ArtifactError;

/// Number of raw bytes in a tree hash (git SHA-1).
pub const HASH_LEN: usize = 20;

/// Content identity of an artifact directory tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactHash([u8; HASH_LEN]);

impl ArtifactHash {
    #[must_use]
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex form, used as the on-disk directory name.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether `value` looks like a hex-encoded tree hash.
    #[must_use]
    pub fn is_hex_hash(value: &str) -> bool {
        value.len() == HASH_LEN * 2 && value.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl FromStr for ArtifactHash {
    type Err = ArtifactError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if !Self::is_hex_hash(value) {
            return Err(ArtifactError::InvalidHash(value.to_string()));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(value, &mut bytes)
            .map_err(|_| ArtifactError::InvalidHash(value.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ArtifactHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ArtifactHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactHash({})", self.to_hex())
    }
}

impl Serialize for ArtifactHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ArtifactHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
