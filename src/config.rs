//! Node configuration.

use crate::address::Address;

/// Configuration for a [`Node`](crate::node::Node).
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Address the listener binds on.
    pub bind_address: Address,
    /// Address stamped as the sender of outgoing messages. May differ from
    /// the bind address when the node is reachable through another endpoint.
    pub advertise_address: Address,
}

impl NodeConfig {
    pub fn new(bind_address: Address, advertise_address: Address) -> Self {
        Self {
            bind_address,
            advertise_address,
        }
    }

    /// Bind and advertise the same endpoint.
    pub fn same(address: Address) -> Self {
        Self {
            bind_address: address.clone(),
            advertise_address: address,
        }
    }
}
