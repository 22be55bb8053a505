//! Event kinds dispatched to the framework and plugins.

/// Peer lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer entered the registry (outbound dial, or an inbound peer's
    /// first validated message).
    Added,
    /// A stored peer's session closed.
    Disconnected,
}

/// Node lifecycle events, dispatched sequentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Startup,
    Close,
}
