//! Signed wire records, layered inside the outer envelope's body.
//!
//! Tag assignments are the wire contract:
//!
//!   SignedRecord: 1 inner (bytes), 2 signature (65 bytes r‖s‖v)
//!   Record:       1 sender, 2 body
//!   NodeRecord:   1 address (20 bytes), 2 network_address ("host:port")

/// A signed record: opaque inner bytes plus the signature over their
/// Keccak-256 digest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub inner: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}

/// The authenticated payload: who sent it, and the application bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    #[prost(message, optional, tag = "1")]
    pub sender: ::core::option::Option<NodeRecord>,
    #[prost(bytes = "vec", tag = "2")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}

/// A node identity on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub address: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub network_address: ::prost::alloc::string::String,
}

/// Body of a "dht.lookup_request".
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupRequest {
    #[prost(message, optional, tag = "1")]
    pub target: ::core::option::Option<NodeRecord>,
}

/// Body of a "dht.lookup_response".
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupResponse {
    #[prost(message, repeated, tag = "1")]
    pub peers: ::prost::alloc::vec::Vec<NodeRecord>,
}
