//! The framework seam.
//!
//! A framework sits between the transport and user plugins: it gates every
//! inbound message through [`validate_message`](Framework::validate_message)
//! and may overlay its own protocol (see [`crate::signed`]). All callbacks
//! default to no-ops so an implementation only overrides what it uses.

use async_trait::async_trait;

use crate::context::{MessageContext, NetworkContext, PeerContext};
use crate::node::Node;

/// Message kind sent to freshly dialed peers by the default framework.
pub const INTRODUCTION_KIND: &str = "legion_introduction";

/// Modifies the underlying communication of a node.
#[async_trait]
pub trait Framework: Send + Sync {
    /// Called once when the node starts listening, before any messages are
    /// dispatched. A framework that needs the node later keeps a
    /// [`WeakNode`](crate::node::WeakNode) here.
    fn configure(&self, _node: &Node) {}

    /// Called before a message is dispatched anywhere. Returning false
    /// silently drops the message.
    async fn validate_message(&self, _ctx: &MessageContext) -> bool {
        true
    }

    /// Called for every validated inbound message, concurrently with the
    /// plugins' callbacks.
    async fn new_message(&self, _ctx: MessageContext) {}

    /// Called when a peer enters the registry. The default introduces the
    /// node to peers it dialed.
    async fn peer_added(&self, ctx: PeerContext) {
        if !ctx.is_incoming {
            ctx.peer
                .queue_message(ctx.node.new_message(INTRODUCTION_KIND, Vec::new()));
        }
    }

    /// Called exactly once when a stored peer's session closes.
    async fn peer_disconnect(&self, _ctx: PeerContext) {}

    /// Called when the node starts listening.
    async fn startup(&self, _ctx: NetworkContext) {}

    /// Called when the node shuts down.
    async fn close(&self, _ctx: NetworkContext) {}
}

/// The default framework: accepts every message and introduces itself to
/// dialed peers.
pub struct GenericFramework;

#[async_trait]
impl Framework for GenericFramework {}
