//! User plugins.
//!
//! Plugins observe the network; unlike the framework they never gate
//! messages. Callbacks default to no-ops. Message callbacks fan out one
//! task per plugin per event, so implementations must synchronize their own
//! state.

use async_trait::async_trait;

use crate::context::{MessageContext, NetworkContext, PeerContext};

/// Reacts to message and peer events.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called for every validated inbound message.
    async fn new_message(&self, _ctx: MessageContext) {}

    /// Called when a peer enters the registry.
    async fn peer_added(&self, _ctx: PeerContext) {}

    /// Called exactly once when a stored peer's session closes.
    async fn peer_disconnect(&self, _ctx: PeerContext) {}

    /// Called when the node starts listening.
    async fn startup(&self, _ctx: NetworkContext) {}

    /// Called when the node shuts down.
    async fn close(&self, _ctx: NetworkContext) {}
}
