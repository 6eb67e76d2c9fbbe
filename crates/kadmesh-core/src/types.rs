//! Identifiers, keys and peer metadata

use crate::{Error, Result, KEY_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of a peer
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Position of this node in the XOR key space
    pub fn kad_id(&self) -> KadId {
        KadId::from_node_id(self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::InvalidNodeId("empty node id".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Fixed-length position of a [`NodeId`] in the key space
///
/// Derived as the BLAKE3 digest of the node id, so the mapping is stable
/// across processes and collision-resistant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KadId([u8; KEY_LEN]);

impl KadId {
    pub fn from_node_id(node_id: &NodeId) -> Self {
        Self(*blake3::hash(node_id.as_str().as_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// XOR distance from this id to a lookup key
    pub fn distance(&self, key: &Key) -> Distance {
        xor_distance(&self.0, key.as_bytes())
    }
}

impl fmt::Debug for KadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KadId({})", hex::encode(&self.0[..8]))
    }
}

/// Target of a lookup
///
/// Lives in the same 256-bit space as [`KadId`] but is not tied to a node:
/// a key can be a content hash as well as a node position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Key of arbitrary content (BLAKE3 digest)
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Parse a hex-encoded 32-byte key
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::try_from(bytes.as_slice())
    }

    /// Generate a random key
    pub fn random() -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| Error::Random(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<&[u8]> for Key {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }
}

impl From<KadId> for Key {
    fn from(id: KadId) -> Self {
        Self(id.0)
    }
}

impl From<&NodeId> for Key {
    fn from(id: &NodeId) -> Self {
        id.kad_id().into()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(&self.0[..8]))
    }
}

/// 256-bit unsigned XOR distance
///
/// Bytes are big-endian, so the derived lexicographic ordering is the
/// unsigned integer ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; KEY_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; KEY_LEN]);
    pub const MAX: Distance = Distance([0xff; KEY_LEN]);

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// `Distance::MAX - self`
    ///
    /// In a fixed-width unsigned space this is the bitwise complement, and
    /// it reverses the ordering: closer distances get larger complements.
    pub fn complement(&self) -> Distance {
        let mut out = [0u8; KEY_LEN];
        for (o, b) in out.iter_mut().zip(self.0.iter()) {
            *o = !b;
        }
        Distance(out)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// XOR distance between two keys
pub fn xor_distance(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN]) -> Distance {
    let mut result = [0u8; KEY_LEN];
    for i in 0..KEY_LEN {
        result[i] = a[i] ^ b[i];
    }
    Distance(result)
}

/// Metadata about a known peer
///
/// Never mutated in place: a refreshed record replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Identifier of the peer
    pub node_id: NodeId,
    /// Host (and port) where the peer's API is reachable
    pub api_host: String,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<NodeId>, api_host: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            api_host: api_host.into(),
        }
    }

    pub fn kad_id(&self) -> KadId {
        self.node_id.kad_id()
    }
}
