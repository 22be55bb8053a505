//! legion-rs — peer-to-peer overlay networking.
//!
//! Nodes connect to each other over TCP, exchange typed messages, broadcast
//! to many peers, and perform bounded request/response exchanges. A pluggable
//! "framework" layer decides which peers are admissible and may overlay its
//! own protocol (the built-in signed framework authenticates every message
//! with a secp256k1 signature and maintains a Kademlia-style routing table);
//! user "plugins" sit above the framework and observe events.
//!
//! # Architecture
//!
//! - **address**: resolved (host, port) endpoint value type
//! - **proto**: outer wire envelope (field-tagged binary encoding)
//! - **wire**: length-prefixed framing over multiplexed sub-streams
//! - **mux**: one yamux session per TCP connection, one sub-stream per message
//! - **peer**: send/receive loops and RPC correlation for one remote
//! - **node**: peer registry, listener, broadcasts, event fan-out
//! - **framework** / **plugin**: callback traits with no-op defaults
//! - **signed**: signature-validating framework with XOR-distance routing

pub mod address;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod framework;
pub mod mux;
pub mod node;
pub mod peer;
pub mod plugin;
pub mod proto;
pub mod signed;
pub mod wire;

// Re-export primary types for convenience
pub use address::Address;
pub use config::NodeConfig;
pub use context::{MessageContext, NetworkContext, PeerContext};
pub use error::{Error, WireError};
pub use events::{NetworkEvent, PeerEvent};
pub use framework::{Framework, GenericFramework, INTRODUCTION_KIND};
pub use node::{Node, WeakNode};
pub use peer::Peer;
pub use plugin::Plugin;
pub use proto::Envelope;
