//! Callback contexts handed to the framework and plugins.

use std::sync::Arc;

use crate::address::Address;
use crate::node::Node;
use crate::peer::Peer;
use crate::proto::Envelope;

/// Context for one validated inbound message.
#[derive(Clone)]
pub struct MessageContext {
    pub node: Node,
    pub message: Envelope,
    /// Decoded sender advertise address.
    pub sender: Address,
}

impl MessageContext {
    /// Reply to the sender.
    ///
    /// If the incoming message is a request, the reply is queued on the
    /// sender's session with the matching rpc id; otherwise it is broadcast
    /// to the sender address.
    pub async fn reply(&self, message: Envelope) {
        if self.message.is_request && self.message.rpc_id > 0 {
            if let Some(peer) = self.node.peer(&self.sender).await {
                peer.queue_reply(self.message.rpc_id, message);
                return;
            }
        }
        self.node
            .broadcast(&message, std::slice::from_ref(&self.sender))
            .await;
    }
}

/// Context for a peer lifecycle event.
#[derive(Clone)]
pub struct PeerContext {
    pub node: Node,
    pub peer: Arc<Peer>,
    /// Whether the remote dialed us.
    pub is_incoming: bool,
}

/// Context for a node lifecycle event.
#[derive(Clone)]
pub struct NetworkContext {
    pub node: Node,
}
