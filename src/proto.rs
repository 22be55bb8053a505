//! Outer wire envelope.
//!
//! Field-tagged binary encoding; the tag assignment below is the wire
//! contract shared with other implementations:
//!
//!   1 sender ("host:port"), 2 kind, 3 body, 4 rpc_id, 5 is_request,
//!   6 is_reply

/// One logical message on the wire.
///
/// `rpc_id` is zero for fire-and-forget messages. `is_request` and
/// `is_reply` only ever accompany a non-zero `rpc_id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    /// Network address the remote can be reached at, "host:port".
    #[prost(string, tag = "1")]
    pub sender: ::prost::alloc::string::String,
    /// Short message type identifier.
    #[prost(string, tag = "2")]
    pub kind: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub rpc_id: u64,
    #[prost(bool, tag = "5")]
    pub is_request: bool,
    #[prost(bool, tag = "6")]
    pub is_reply: bool,
}

impl Envelope {
    /// A fire-and-forget envelope. The node's message factory stamps the
    /// sender with its advertise address.
    pub fn new(sender: String, kind: &str, body: Vec<u8>) -> Self {
        Self {
            sender,
            kind: kind.to_string(),
            body,
            rpc_id: 0,
            is_request: false,
            is_reply: false,
        }
    }
}
