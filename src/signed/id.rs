//! Routing identities.

use std::fmt;

use super::proto::NodeRecord;

/// A node's routing identity: its 20-byte public address plus the network
/// address it can be reached at.
///
/// Two ids are equal only when both parts match; XOR distance is computed
/// over the public address alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeId {
    pub address: Vec<u8>,
    pub network_address: String,
}

impl NodeId {
    pub fn new(address: impl Into<Vec<u8>>, network_address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            network_address: network_address.into(),
        }
    }

    /// XOR distance to another id, byte for byte.
    pub fn distance(&self, other: &NodeId) -> Vec<u8> {
        self.address
            .iter()
            .zip(other.address.iter())
            .map(|(a, b)| a ^ b)
            .collect()
    }

    /// Bucket index of `other` relative to `self`: the number of leading
    /// zero bits of the XOR distance.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        prefix_len(&self.distance(other))
    }

    pub fn address_hex(&self) -> String {
        hex::encode(&self.address)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address_hex(), self.network_address)
    }
}

impl From<NodeRecord> for NodeId {
    fn from(record: NodeRecord) -> Self {
        Self {
            address: record.address,
            network_address: record.network_address,
        }
    }
}

impl From<NodeId> for NodeRecord {
    fn from(id: NodeId) -> Self {
        Self {
            address: id.address,
            network_address: id.network_address,
        }
    }
}

/// Leading zero bits of a distance. An all-zero distance (self) maps to the
/// last bucket.
fn prefix_len(distance: &[u8]) -> usize {
    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            return i * 8 + byte.leading_zeros() as usize;
        }
    }
    (distance.len() * 8).saturating_sub(1)
}
